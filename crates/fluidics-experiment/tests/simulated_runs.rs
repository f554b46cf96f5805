use fluidics_core::capabilities::ThermalChannel;
use fluidics_experiment::{
    build_protocol, EngineEvent, ProtocolSettings, RunOutcome, SequenceEngine, StepStatus,
};
use fluidics_hardware::{load_config_from_str, read_steps, Instrument};
use std::time::Duration;

const MERFISH_CONFIG: &str = r#"
    application = "MERFISH"

    [simulation]
    time_scale = 0.0

    [syringe_pump]
    volume_ul = 5000
    speed_code_limit = 10
    extract_port = 1
    dispense_port = 2
    waste_port = 3

    [selector_valves]
    valve_ids_allowed = [1, 2]

    [selector_valves.number_of_ports]
    "1" = 10
    "2" = 10

    [selector_valves.tubing_fluid_amount_to_valve_ul]
    "1" = 500
    "2" = 350

    [selector_valves.tubing_fluid_amount_to_port_ul]
    port_1 = 100
    port_5 = 80
"#;

const OPEN_CHAMBER_CONFIG: &str = r#"
    application = "Open Chamber"
    chamber_volume_ul = 1000
    tubing_fluid_amount_sv_to_sp_ul = 200
    tubing_fluid_amount_sp_to_oc_ul = 150

    [temperature_controller]
    use_temperature_controller = true
    poll_interval_ms = 10
    stabilize_timeout_s = 30

    [simulation]
    time_scale = 0.0

    [syringe_pump]
    volume_ul = 5000
    speed_code_limit = 10
    extract_port = 1
    dispense_port = 2
    waste_port = 3

    [selector_valves]
    valve_ids_allowed = [1]

    [selector_valves.number_of_ports]
    "1" = 10

    [selector_valves.tubing_fluid_amount_to_valve_ul]
    "1" = 100
"#;

const STEP_HEADER: &str =
    "sequence_name,fluidic_port,flow_rate,volume,incubation_time,repeat,fill_tubing_with,include\n";

async fn engine_for(config: &str) -> (Instrument, SequenceEngine) {
    let config = load_config_from_str(config).unwrap();
    let settings = ProtocolSettings::from_config(&config);
    let instrument = Instrument::simulated(config).await.unwrap();
    let protocol = build_protocol(&instrument, settings).unwrap();
    let engine = SequenceEngine::new(protocol).with_incubation_scale(0.0);
    (instrument, engine)
}

fn steps(rows: &str) -> Vec<fluidics_core::Step> {
    read_steps(format!("{STEP_HEADER}{rows}").as_bytes()).unwrap()
}

fn completed(events: &[EngineEvent]) -> Vec<(usize, u32)> {
    events
        .iter()
        .filter_map(|event| match event {
            EngineEvent::Progress {
                step_index,
                iteration,
                status: StepStatus::Completed,
            } => Some((*step_index, *iteration)),
            _ => None,
        })
        .collect()
}

fn errors(events: &[EngineEvent]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|event| match event {
            EngineEvent::Error { message } => Some(message.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_merfish_table_runs_to_completion() {
    let (instrument, engine) = engine_for(MERFISH_CONFIG).await;
    let table = steps(
        "Priming,19,5000,2000,0,1,0,1\n\
         Flow Wash Buffer,3,1000,500,0,1,0,0\n\
         Flow Hybridization Buffer,4,1000,1000,1,3,19,1\n",
    );

    let (events, outcome) = engine.start(table).unwrap().collect().await.unwrap();

    assert_eq!(outcome, RunOutcome::Completed);
    assert!(errors(&events).is_empty());
    match events.first() {
        Some(EngineEvent::Estimate(estimate)) => assert_eq!(estimate.total_iterations, 4),
        other => panic!("first event was {other:?}"),
    }
    // The disabled row keeps its index but is never reported.
    assert_eq!(completed(&events), vec![(0, 1), (2, 2), (2, 3), (2, 4)]);
    assert_eq!(instrument.router().current_port(), 19);
    assert!(instrument.pump().current_volume_ul() > 0.0);
    assert_eq!(
        events.last(),
        Some(&EngineEvent::Finished {
            outcome: RunOutcome::Completed
        })
    );

    instrument.shutdown(true).await.unwrap();
    assert_eq!(instrument.pump().current_volume_ul(), 0.0);
}

#[tokio::test]
async fn test_invalid_row_stops_before_any_hardware() {
    let (instrument, engine) = engine_for(MERFISH_CONFIG).await;
    // Port 3 sits on the upstream valve and cannot fill the shared tubing.
    let table = steps(
        "Flow Wash Buffer,4,1000,500,0,1,0,1\n\
         Flow Hybridization Buffer,4,1000,1000,0,1,3,1\n",
    );

    let (events, outcome) = engine.start(table).unwrap().collect().await.unwrap();

    assert_eq!(outcome, RunOutcome::Failed);
    let errors = errors(&events);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].starts_with("Error processing step 2"));
    assert!(completed(&events).is_empty());
    assert_eq!(instrument.pump().current_volume_ul(), 0.0);
}

#[tokio::test]
async fn test_abort_leaves_engine_ready_for_next_run() {
    let (instrument, engine) = engine_for(MERFISH_CONFIG).await;
    let engine = engine.with_incubation_scale(1.0);
    let table = steps("Flow Wash Buffer,12,1000,500,30,2,0,1\n");

    let mut run = engine.start(table.clone()).unwrap();
    let abort = run.abort_handle();
    let mut events = Vec::new();
    while let Some(event) = tokio::time::timeout(Duration::from_secs(5), run.next_event())
        .await
        .unwrap()
    {
        if matches!(
            event,
            EngineEvent::Progress {
                status: StepStatus::Incubating,
                ..
            }
        ) {
            abort.abort().await;
        }
        events.push(event);
    }
    assert_eq!(run.join().await.unwrap(), RunOutcome::Aborted);
    assert_eq!(errors(&events), vec!["Operation aborted by user"]);
    assert!(!instrument.pump().is_aborted());

    let engine = engine.with_incubation_scale(0.0);
    let (_, outcome) = engine.start(table).unwrap().collect().await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed);
}

#[tokio::test]
async fn test_open_chamber_table_with_temperature_hold() {
    let (instrument, engine) = engine_for(OPEN_CHAMBER_CONFIG).await;
    let table = steps(
        "Priming,10,5000,1000,0,1,0,1\n\
         Clear Tubings and Add Reagent,4,1000,800,0,1,0,1\n\
         Set Temperature 29,1,1000,0,0,1,0,1\n\
         Wash with Constant Flow,5,1000,2000,0,2,0,1\n\
         Add Reagent,6,1000,500,0,1,0,1\n",
    );

    let (events, outcome) = tokio::time::timeout(
        Duration::from_secs(10),
        engine.start(table).unwrap().collect(),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(outcome, RunOutcome::Completed, "errors: {:?}", errors(&events));
    assert_eq!(completed(&events).len(), 6);

    let thermal = instrument.thermal().unwrap();
    assert_eq!(thermal.target_temperature(ThermalChannel::Tc1), 29.0);
    assert_eq!(thermal.target_temperature(ThermalChannel::Tc2), 29.0);
    assert!(!instrument.air_pump().unwrap().is_running());

    instrument.shutdown(false).await.unwrap();
}

#[tokio::test]
async fn test_aborted_open_chamber_run_clears_every_device_flag() {
    let (instrument, engine) = engine_for(OPEN_CHAMBER_CONFIG).await;
    let engine = engine.with_incubation_scale(1.0);
    let table = steps(
        "Add Reagent,6,1000,500,30,1,0,1\n\
         Wash with Constant Flow,5,1000,2000,0,1,0,1\n",
    );

    let mut run = engine.start(table.clone()).unwrap();
    let abort = run.abort_handle();
    let mut events = Vec::new();
    while let Some(event) = tokio::time::timeout(Duration::from_secs(5), run.next_event())
        .await
        .unwrap()
    {
        if matches!(
            event,
            EngineEvent::Progress {
                status: StepStatus::Incubating,
                ..
            }
        ) {
            // Not awaited here, so the run unwinds while the abort is in flight.
            let abort = abort.clone();
            tokio::spawn(async move { abort.abort().await });
        }
        events.push(event);
    }
    assert_eq!(run.join().await.unwrap(), RunOutcome::Aborted);
    assert_eq!(errors(&events), vec!["Operation aborted by user"]);

    assert!(!instrument.pump().is_aborted());
    assert!(!instrument.air_pump().unwrap().is_aborted());
    assert!(!instrument.thermal().unwrap().is_aborted());

    let engine = engine.with_incubation_scale(0.0);
    let (events, outcome) = tokio::time::timeout(
        Duration::from_secs(10),
        engine.start(table).unwrap().collect(),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(outcome, RunOutcome::Completed, "errors: {:?}", errors(&events));
    assert_eq!(completed(&events).len(), 2);

    instrument.shutdown(false).await.unwrap();
}

#[tokio::test]
async fn test_abort_before_start_does_not_leak_into_run() {
    let (instrument, engine) = engine_for(MERFISH_CONFIG).await;
    engine.abort().await;
    assert!(!instrument.pump().is_aborted());

    let table = steps("Flow Wash Buffer,12,1000,500,0,2,0,1\n");
    let (events, outcome) = engine.start(table).unwrap().collect().await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed);
    assert!(errors(&events).is_empty());
    assert_eq!(completed(&events), vec![(0, 1), (0, 2)]);
}
