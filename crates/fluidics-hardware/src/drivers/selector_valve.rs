//! Chained rotary selector valves.
//!
//! Valves are daisy-chained: every valve except the last reserves its
//! highest-numbered port as a pass-through to the next valve downstream, and
//! the last (common) valve feeds the syringe pump. Logical ports are numbered
//! from 1 across the chain in order, skipping pass-through ports, so a chain
//! of `[4, 4, 6]` port valves exposes `3 + 3 + 6 = 12` logical ports.
//!
//! [`ValveChain`] is the pure routing plan. [`SelectorValveSystem`] drives it
//! through the microcontroller and [`SimulatedValveSystem`] records the moves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use fluidics_core::capabilities::PortRouter;
use fluidics_core::controller::{ControllerCommand, SharedController};
use fluidics_core::error::RoutingError;
use parking_lot::Mutex;
use tracing::{debug, info};

// =============================================================================
// Routing Plan
// =============================================================================

/// One valve in the chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ValveSpec {
    /// Controller address
    pub id: u8,
    /// Physical ports, pass-through included
    pub port_count: u32,
    /// Tubing volume from this valve to the syringe pump, in µL.
    pub dead_volume_to_valve_ul: f64,
}

/// A single physical valve rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValveMove {
    /// Controller address of the valve
    pub valve_id: u8,
    /// Physical port on that valve
    pub port: u32,
}

/// Ordered valve chain with per-port metadata.
#[derive(Debug, Clone)]
pub struct ValveChain {
    valves: Vec<ValveSpec>,
    port_dead_volumes: HashMap<u32, f64>,
    reagent_names: HashMap<u32, String>,
}

impl ValveChain {
    /// Chain `valves` upstream to downstream; the last one feeds the syringe.
    pub fn new(valves: Vec<ValveSpec>) -> Result<Self> {
        let Some((last, upstream)) = valves.split_last() else {
            bail!("A valve chain needs at least one valve");
        };
        for valve in upstream {
            if valve.port_count < 2 {
                bail!(
                    "Valve {} has {} ports; chained valves need a pass-through port plus at least one reagent port",
                    valve.id,
                    valve.port_count
                );
            }
        }
        if last.port_count == 0 {
            bail!("Valve {} has no ports", last.id);
        }
        Ok(Self {
            valves,
            port_dead_volumes: HashMap::new(),
            reagent_names: HashMap::new(),
        })
    }

    /// Tubing volume from each logical port to its valve, in µL.
    pub fn with_port_dead_volumes(mut self, volumes: HashMap<u32, f64>) -> Self {
        self.port_dead_volumes = volumes;
        self
    }

    /// Reagent labels per logical port.
    pub fn with_reagent_names(mut self, names: HashMap<u32, String>) -> Self {
        self.reagent_names = names;
        self
    }

    /// Valves in chain order.
    pub fn valves(&self) -> &[ValveSpec] {
        &self.valves
    }

    /// Reagent ports on the upstream valves (pass-throughs excluded).
    fn upstream_ports(&self) -> u32 {
        self.upstream().iter().map(|v| v.port_count - 1).sum()
    }

    fn upstream(&self) -> &[ValveSpec] {
        &self.valves[..self.valves.len() - 1]
    }

    fn terminal(&self) -> &ValveSpec {
        &self.valves[self.valves.len() - 1]
    }

    /// Logical ports reachable through the chain.
    pub fn addressable_ports(&self) -> u32 {
        self.upstream_ports() + self.terminal().port_count
    }

    /// Valve index holding `logical_port`, and the port number on that valve.
    fn locate(&self, logical_port: u32) -> Option<(usize, u32)> {
        if logical_port == 0 || logical_port > self.addressable_ports() {
            return None;
        }
        let mut processed = 0;
        for (index, valve) in self.upstream().iter().enumerate() {
            let reagent_ports = valve.port_count - 1;
            if logical_port > processed + reagent_ports {
                processed += reagent_ports;
            } else {
                return Some((index, logical_port - processed));
            }
        }
        Some((self.valves.len() - 1, logical_port - processed))
    }

    /// Valve moves that connect `logical_port` to the pump, upstream first.
    ///
    /// Returns `None` for ports outside `1..=addressable_ports()`.
    pub fn route(&self, logical_port: u32) -> Option<Vec<ValveMove>> {
        let (target, port) = self.locate(logical_port)?;
        let moves = self
            .valves
            .iter()
            .enumerate()
            .take(target + 1)
            .map(|(index, valve)| ValveMove {
                valve_id: valve.id,
                port: if index == target {
                    port
                } else {
                    valve.port_count
                },
            })
            .collect();
        Some(moves)
    }

    /// Rest position: upstream valves on pass-through, common valve on port 1.
    pub fn home_moves(&self) -> Vec<ValveMove> {
        let mut moves: Vec<ValveMove> = self
            .upstream()
            .iter()
            .map(|valve| ValveMove {
                valve_id: valve.id,
                port: valve.port_count,
            })
            .collect();
        moves.push(ValveMove {
            valve_id: self.terminal().id,
            port: 1,
        });
        moves
    }

    /// Logical port selected by [`home_moves`](Self::home_moves).
    pub fn home_port(&self) -> u32 {
        self.upstream_ports() + 1
    }

    /// True when `logical_port` sits on the last valve.
    pub fn is_terminal_port(&self, logical_port: u32) -> bool {
        matches!(self.locate(logical_port), Some((index, _)) if index == self.valves.len() - 1)
    }

    /// Tubing volume from the valve holding `logical_port` to the syringe.
    pub fn dead_volume_to_valve(&self, logical_port: u32) -> f64 {
        // Out-of-range ports count as the common valve's line.
        let index = self
            .locate(logical_port)
            .map_or(self.valves.len() - 1, |(index, _)| index);
        self.valves[index].dead_volume_to_valve_ul
    }

    /// Tubing volume from the reagent bottle to its valve; 0 when unknown.
    pub fn dead_volume_to_port(&self, logical_port: u32) -> f64 {
        self.port_dead_volumes
            .get(&logical_port)
            .copied()
            .unwrap_or(0.0)
    }

    /// Configured reagent label, if any.
    pub fn reagent_name(&self, logical_port: u32) -> Option<&str> {
        self.reagent_names.get(&logical_port).map(String::as_str)
    }
}

// =============================================================================
// Hardware Router
// =============================================================================

/// Selector valves driven through the microcontroller.
pub struct SelectorValveSystem {
    chain: ValveChain,
    controller: SharedController,
    current_port: AtomicU32,
}

impl SelectorValveSystem {
    /// Initialize every valve and park the chain in its rest position.
    pub async fn initialize(chain: ValveChain, controller: SharedController) -> Result<Self> {
        for valve in chain.valves() {
            controller
                .exchange(ControllerCommand::InitializeRotary {
                    valve_id: valve.id,
                    port_count: valve.port_count,
                })
                .await?;
        }
        for mv in chain.home_moves() {
            controller
                .exchange(ControllerCommand::SetRotaryValve {
                    valve_id: mv.valve_id,
                    port: mv.port,
                })
                .await?;
        }
        let home = chain.home_port();
        info!(
            valves = chain.valves().len(),
            ports = chain.addressable_ports(),
            home,
            "Selector valves initialized"
        );
        Ok(Self {
            chain,
            controller,
            current_port: AtomicU32::new(home),
        })
    }

    pub fn chain(&self) -> &ValveChain {
        &self.chain
    }
}

#[async_trait]
impl PortRouter for SelectorValveSystem {
    async fn open(&self, logical_port: u32) -> Result<(), RoutingError> {
        let Some(moves) = self.chain.route(logical_port) else {
            debug!(logical_port, "Port outside the valve chain, not moving");
            return Ok(());
        };
        for mv in moves {
            self.controller
                .exchange(ControllerCommand::SetRotaryValve {
                    valve_id: mv.valve_id,
                    port: mv.port,
                })
                .await
                .map_err(|e| RoutingError::Valve {
                    valve_id: mv.valve_id,
                    port: mv.port,
                    message: format!("{e:#}"),
                })?;
        }
        self.current_port.store(logical_port, Ordering::SeqCst);
        debug!(logical_port, "Port opened");
        Ok(())
    }

    fn current_port(&self) -> u32 {
        self.current_port.load(Ordering::SeqCst)
    }

    fn addressable_ports(&self) -> u32 {
        self.chain.addressable_ports()
    }

    fn is_terminal_port(&self, logical_port: u32) -> bool {
        self.chain.is_terminal_port(logical_port)
    }

    fn dead_volume_to_valve(&self, logical_port: u32) -> f64 {
        self.chain.dead_volume_to_valve(logical_port)
    }

    fn dead_volume_to_port(&self, logical_port: u32) -> f64 {
        self.chain.dead_volume_to_port(logical_port)
    }

    fn reagent_name(&self, logical_port: u32) -> Option<String> {
        self.chain.reagent_name(logical_port).map(str::to_string)
    }
}

// =============================================================================
// Simulated Router
// =============================================================================

/// Valve chain without hardware; records every physical move.
pub struct SimulatedValveSystem {
    chain: ValveChain,
    moves: Arc<Mutex<Vec<ValveMove>>>,
    current_port: AtomicU32,
}

impl SimulatedValveSystem {
    pub fn new(chain: ValveChain) -> Self {
        let home = chain.home_port();
        let moves = chain.home_moves();
        Self {
            chain,
            moves: Arc::new(Mutex::new(moves)),
            current_port: AtomicU32::new(home),
        }
    }

    /// Every valve move so far, including the initial homing.
    pub fn moves(&self) -> Vec<ValveMove> {
        self.moves.lock().clone()
    }

    /// Forget recorded moves, homing included.
    pub fn clear_moves(&self) {
        self.moves.lock().clear();
    }

    pub fn chain(&self) -> &ValveChain {
        &self.chain
    }
}

#[async_trait]
impl PortRouter for SimulatedValveSystem {
    async fn open(&self, logical_port: u32) -> Result<(), RoutingError> {
        let Some(moves) = self.chain.route(logical_port) else {
            debug!(logical_port, "Port outside the valve chain, not moving");
            return Ok(());
        };
        self.moves.lock().extend(moves);
        self.current_port.store(logical_port, Ordering::SeqCst);
        debug!(logical_port, "Simulated port opened");
        Ok(())
    }

    fn current_port(&self) -> u32 {
        self.current_port.load(Ordering::SeqCst)
    }

    fn addressable_ports(&self) -> u32 {
        self.chain.addressable_ports()
    }

    fn is_terminal_port(&self, logical_port: u32) -> bool {
        self.chain.is_terminal_port(logical_port)
    }

    fn dead_volume_to_valve(&self, logical_port: u32) -> f64 {
        self.chain.dead_volume_to_valve(logical_port)
    }

    fn dead_volume_to_port(&self, logical_port: u32) -> f64 {
        self.chain.dead_volume_to_port(logical_port)
    }

    fn reagent_name(&self, logical_port: u32) -> Option<String> {
        self.chain.reagent_name(logical_port).map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::controller::SimulatedController;

    fn chain_4_4_6() -> ValveChain {
        ValveChain::new(vec![
            ValveSpec {
                id: 1,
                port_count: 4,
                dead_volume_to_valve_ul: 300.0,
            },
            ValveSpec {
                id: 2,
                port_count: 4,
                dead_volume_to_valve_ul: 200.0,
            },
            ValveSpec {
                id: 3,
                port_count: 6,
                dead_volume_to_valve_ul: 100.0,
            },
        ])
        .unwrap()
    }

    fn mv(valve_id: u8, port: u32) -> ValveMove {
        ValveMove { valve_id, port }
    }

    #[test]
    fn test_addressable_ports() {
        assert_eq!(chain_4_4_6().addressable_ports(), 12);
    }

    #[test]
    fn test_route_through_pass_through() {
        let chain = chain_4_4_6();
        assert_eq!(chain.route(4), Some(vec![mv(1, 4), mv(2, 1)]));
        assert_eq!(chain.route(12), Some(vec![mv(1, 4), mv(2, 4), mv(3, 6)]));
        assert_eq!(chain.route(1), Some(vec![mv(1, 1)]));
        assert_eq!(chain.route(7), Some(vec![mv(1, 4), mv(2, 4), mv(3, 1)]));
    }

    #[test]
    fn test_route_out_of_range_is_none() {
        let chain = chain_4_4_6();
        assert_eq!(chain.route(13), None);
        assert_eq!(chain.route(0), None);
    }

    #[test]
    fn test_single_valve_chain() {
        let chain = ValveChain::new(vec![ValveSpec {
            id: 1,
            port_count: 10,
            dead_volume_to_valve_ul: 50.0,
        }])
        .unwrap();
        assert_eq!(chain.addressable_ports(), 10);
        assert_eq!(chain.route(10), Some(vec![mv(1, 10)]));
        assert_eq!(chain.home_port(), 1);
        assert!(chain.is_terminal_port(3));
    }

    #[test]
    fn test_lookups_follow_the_owning_valve() {
        let chain = chain_4_4_6()
            .with_port_dead_volumes(HashMap::from([(5, 42.0)]))
            .with_reagent_names(HashMap::from([(12, "Wash buffer".to_string())]));
        assert_eq!(chain.dead_volume_to_valve(3), 300.0);
        assert_eq!(chain.dead_volume_to_valve(4), 200.0);
        assert_eq!(chain.dead_volume_to_valve(12), 100.0);
        assert_eq!(chain.dead_volume_to_port(5), 42.0);
        assert_eq!(chain.dead_volume_to_port(6), 0.0);
        assert_eq!(chain.reagent_name(12), Some("Wash buffer"));
        assert!(!chain.is_terminal_port(6));
        assert!(chain.is_terminal_port(7));
        assert!(!chain.is_terminal_port(13));
    }

    #[test]
    fn test_rejects_bad_chains() {
        assert!(ValveChain::new(vec![]).is_err());
        assert!(ValveChain::new(vec![
            ValveSpec {
                id: 1,
                port_count: 1,
                dead_volume_to_valve_ul: 0.0,
            },
            ValveSpec {
                id: 2,
                port_count: 6,
                dead_volume_to_valve_ul: 0.0,
            },
        ])
        .is_err());
    }

    #[tokio::test]
    async fn test_hardware_router_homes_and_routes() {
        let controller = SimulatedController::new();
        let log = controller.log();
        let router = SelectorValveSystem::initialize(chain_4_4_6(), SharedController::new(controller))
            .await
            .unwrap();

        assert_eq!(router.current_port(), 7);
        assert_eq!(
            log.commands(),
            vec![
                ControllerCommand::InitializeRotary { valve_id: 1, port_count: 4 },
                ControllerCommand::InitializeRotary { valve_id: 2, port_count: 4 },
                ControllerCommand::InitializeRotary { valve_id: 3, port_count: 6 },
                ControllerCommand::SetRotaryValve { valve_id: 1, port: 4 },
                ControllerCommand::SetRotaryValve { valve_id: 2, port: 4 },
                ControllerCommand::SetRotaryValve { valve_id: 3, port: 1 },
            ]
        );
        log.clear();

        router.open(4).await.unwrap();
        assert_eq!(router.current_port(), 4);
        assert_eq!(
            log.commands(),
            vec![
                ControllerCommand::SetRotaryValve { valve_id: 1, port: 4 },
                ControllerCommand::SetRotaryValve { valve_id: 2, port: 1 },
            ]
        );
        assert_eq!(log.completions(), 2);
    }

    #[tokio::test]
    async fn test_out_of_range_open_is_silent() {
        let router = SimulatedValveSystem::new(chain_4_4_6());
        router.clear_moves();
        router.open(13).await.unwrap();
        assert!(router.moves().is_empty());
        assert_eq!(router.current_port(), 7);
    }

    #[tokio::test]
    async fn test_controller_failure_is_a_routing_error() {
        let controller = SimulatedController::new();
        let log = controller.log();
        let router = SelectorValveSystem::initialize(chain_4_4_6(), SharedController::new(controller))
            .await
            .unwrap();
        log.fail_next("valve 2 stalled");

        let err = router.open(4).await.unwrap_err();
        assert_eq!(
            err,
            RoutingError::Valve {
                valve_id: 1,
                port: 4,
                message: "valve 2 stalled".into()
            }
        );
        assert_eq!(router.current_port(), 7);
    }
}
