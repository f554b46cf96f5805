//! Cross-field validation and derived views of the configuration.
//!
//! `serde_valid` checks single fields; the rules here need several sections
//! at once (valve ids against per-valve maps, port keys against the chain
//! size, syringe port roles against the installed valve head).

use std::collections::HashMap;

use anyhow::{anyhow, Result};

use super::schema::{parse_port_key, Application, FluidicsConfig};
use crate::drivers::selector_valve::{ValveChain, ValveSpec};

/// Largest fraction of the barrel a single chamber fill may use.
const MAX_CHAMBER_FILL_FRACTION: f64 = 0.95;

/// Build the valve chain described by `[selector_valves]`.
pub fn build_valve_chain(config: &FluidicsConfig) -> Result<ValveChain> {
    let valves = &config.selector_valves;
    let specs = valves
        .valve_ids_allowed
        .iter()
        .map(|id| {
            let key = id.to_string();
            let port_count = *valves
                .number_of_ports
                .get(&key)
                .ok_or_else(|| anyhow!("selector_valves.number_of_ports has no entry for valve {id}"))?;
            let dead_volume = *valves
                .tubing_fluid_amount_to_valve_ul
                .get(&key)
                .ok_or_else(|| {
                    anyhow!("selector_valves.tubing_fluid_amount_to_valve_ul has no entry for valve {id}")
                })?;
            Ok(ValveSpec {
                id: *id,
                port_count,
                dead_volume_to_valve_ul: dead_volume,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let chain = ValveChain::new(specs)?;
    let port_dead_volumes = port_map(&valves.tubing_fluid_amount_to_port_ul, "tubing_fluid_amount_to_port_ul")?;
    let reagent_names = port_map(&valves.reagent_name_mapping, "reagent_name_mapping")?;
    Ok(chain
        .with_port_dead_volumes(port_dead_volumes)
        .with_reagent_names(reagent_names))
}

fn port_map<V: Clone>(map: &HashMap<String, V>, name: &str) -> Result<HashMap<u32, V>> {
    map.iter()
        .map(|(key, value)| {
            parse_port_key(key)
                .map(|port| (port, value.clone()))
                .ok_or_else(|| anyhow!("selector_valves.{name}: key '{key}' is not of the form port_N"))
        })
        .collect()
}

/// Check rules spanning several sections. Returns every violation found.
pub fn validate_fluidics_config(config: &FluidicsConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    match build_valve_chain(config) {
        Ok(chain) => {
            let total = chain.addressable_ports();
            let valves = &config.selector_valves;
            for key in valves
                .tubing_fluid_amount_to_port_ul
                .keys()
                .chain(valves.reagent_name_mapping.keys())
            {
                if let Some(port) = parse_port_key(key) {
                    if port == 0 || port > total {
                        errors.push(format!(
                            "selector_valves: {key} is outside the {total} ports of the valve chain"
                        ));
                    }
                }
            }
            for (key, volume) in &valves.tubing_fluid_amount_to_port_ul {
                if *volume < 0.0 {
                    errors.push(format!(
                        "selector_valves.tubing_fluid_amount_to_port_ul.{key} must be >= 0"
                    ));
                }
            }
        }
        Err(e) => errors.push(e.to_string()),
    }

    let pump = &config.syringe_pump;
    if !pump.ports_allowed.is_empty() {
        for (role, port) in [
            ("extract_port", pump.extract_port),
            ("dispense_port", pump.dispense_port),
            ("waste_port", pump.waste_port),
        ] {
            if !pump.ports_allowed.contains(&port) {
                errors.push(format!(
                    "syringe_pump.{role} = {port} is not in ports_allowed {:?}",
                    pump.ports_allowed
                ));
            }
        }
    }

    if config.application == Application::OpenChamber {
        if config.chamber_volume_ul <= 0.0 {
            errors.push("chamber_volume_ul must be > 0 for the Open Chamber application".into());
        }
        let limit = MAX_CHAMBER_FILL_FRACTION * pump.volume_ul;
        if config.chamber_volume_ul > limit {
            errors.push(format!(
                "chamber_volume_ul = {} exceeds {:.0}% of the {} uL syringe",
                config.chamber_volume_ul,
                MAX_CHAMBER_FILL_FRACTION * 100.0,
                pump.volume_ul
            ));
        }
    } else if config.enabled_temperature_controller().is_some() {
        errors.push("temperature_controller is only supported for the Open Chamber application".into());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
