use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use clap::{App, Arg};
use colored::*;
use tokio::time;
use tracing::info;

use ecallsim::config::{EcallConfig, FailureProfile, OperatingMode, RedialPolicy};
use ecallsim::ecall::{EcallEventId, EcallSession, EcallStateMachine};
use ecallsim::service::SimulatedCallService;

// One real-time tick drives one simulated second.
const TICK_MS: u64 = 1_000;
const REAL_TICK: Duration = Duration::from_millis(200);
const SIM_WINDOW_MS: u64 = 180_000;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("ecallsim")
        .version("0.1.0")
        .about("Drives a simulated eCall through the HLAP signaling procedure")
        .arg(
            Arg::with_name("policy")
                .long("policy")
                .takes_value(true)
                .possible_values(&["success", "callorig", "calldrop"])
                .default_value("success")
                .help("Configured redial policy"),
        )
        .arg(
            Arg::with_name("ng")
                .long("ng")
                .help("Next-generation (IMS) eCall instead of circuit-switched"),
        )
        .arg(
            Arg::with_name("no-msd")
                .long("no-msd")
                .help("Voice-only call without MSD transmission"),
        )
        .arg(
            Arg::with_name("custom-number")
                .long("custom-number")
                .help("Custom-number call instead of a regulatory emergency number"),
        )
        .arg(
            Arg::with_name("alack")
                .long("alack")
                .help("AL-ACK with clear-down configured"),
        )
        .arg(
            Arg::with_name("ecall-only")
                .long("ecall-only")
                .help("eCall-only operating mode"),
        )
        .arg(
            Arg::with_name("fail-timer")
                .long("fail-timer")
                .takes_value(true)
                .possible_values(&["t5", "t6", "t7"])
                .help("Let the named HLAP timer run to expiry"),
        )
        .arg(
            Arg::with_name("hangup-after")
                .long("hangup-after")
                .takes_value(true)
                .help("Seconds of conversation before the user hangs up"),
        )
        .get_matches();

    let mut config = EcallConfig::default();
    config.policy = match matches.value_of("policy").unwrap_or("success") {
        "callorig" => RedialPolicy::CallOrig,
        "calldrop" => RedialPolicy::CallDrop,
        _ => RedialPolicy::Success,
    };
    config.ng_call = matches.is_present("ng");
    config.msd_required = !matches.is_present("no-msd");
    config.custom_number = matches.is_present("custom-number");
    config.alack_cleardown = matches.is_present("alack");
    if matches.is_present("ecall-only") {
        config.operating_mode = OperatingMode::EcallOnly;
    }
    match matches.value_of("fail-timer") {
        Some("t5") => config.failures.push(FailureProfile::T5Failed),
        Some("t6") => config.failures.push(FailureProfile::T6Failed),
        Some("t7") => config.failures.push(FailureProfile::T7Failed),
        _ => {}
    }

    // Short windows so a demo run completes within the simulation window.
    config.redial.call_orig_gaps_ms = vec![5_000, 10_000, 15_000];
    config.redial.call_drop_gaps_ms = vec![5_000, 10_000, 15_000];
    config.timers.t2_ms = 60_000;
    config.timers.t9_ms = 30_000;
    config.timers.t10_ms = 45_000;

    let hangup_after_ms = matches
        .value_of("hangup-after")
        .and_then(|value| value.parse::<u64>().ok())
        .map(|seconds| seconds * 1_000);

    println!("{}", "📞 eCall Signaling Simulator".bold());
    println!("   Policy: {}", config.policy.as_str());
    println!(
        "   Call class: {}{}",
        if config.ng_call { "NG" } else { "CS" },
        if config.custom_number {
            ", custom number"
        } else {
            ", regulatory"
        }
    );

    let service = Rc::new(RefCell::new(SimulatedCallService::new(&config)));
    let mut ecall = EcallStateMachine::new(service.clone(), EcallSession::from_config(&config));

    ecall.start();
    ecall.run_until_idle();
    info!(chain = %ecall.active_chain(), "eCall started");

    let mut interval = time::interval(REAL_TICK);
    let mut elapsed_ms = 0u64;
    let mut printed = 0usize;
    let mut hangup_sent = false;

    print_new(&service, &mut printed);

    while ecall.is_started() && elapsed_ms < SIM_WINDOW_MS {
        interval.tick().await;

        service.borrow_mut().advance(TICK_MS);
        elapsed_ms += TICK_MS;

        if let Some(after) = hangup_after_ms {
            if !hangup_sent && elapsed_ms >= after {
                let event = EcallStateMachine::create_event(
                    EcallEventId::HangupFromUser,
                    "USER",
                    config.line_id,
                );
                ecall.on_event(&event);
                hangup_sent = true;
                println!("{}", "☎️  user hangup injected".yellow());
            }
        }

        ecall.run_until_idle();
        print_new(&service, &mut printed);
    }

    if ecall.is_started() {
        println!(
            "{} (resting in {})",
            "⏱  simulation window elapsed".bold(),
            ecall.active_chain()
        );
        ecall.stop();
    } else {
        println!("{}", "🛑 eCall machine stopped".bold());
    }

    Ok(())
}

fn print_new(service: &Rc<RefCell<SimulatedCallService>>, printed: &mut usize) {
    let svc = service.borrow();
    for notification in &svc.notifications()[*printed..] {
        match serde_json::to_string(notification) {
            Ok(json) => println!("  {}", json.as_str().cyan()),
            Err(error) => eprintln!("notification serialize error: {}", error),
        }
    }
    *printed = svc.notifications().len();
}
