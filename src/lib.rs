//! # eCall Signaling Simulator
//!
//! A single-process simulation of the automotive emergency-call (eCall)
//! signaling procedure, built on a reusable hierarchical state-machine
//! engine.
//!
//! ## Features
//!
//! - **Generic engine**: composite states, exit/entry ordering, deepest
//!   active state reporting
//! - **eCall procedure**: call setup, MSD transmission with CRC/ack
//!   handling, redial-on-failure, PSAP callback windows
//! - **HLAP timers**: `T2,T5,T6,T7,T9,T10` with self-cancelling expiry
//!   watchers over a logical clock
//! - **Deterministic**: no wall-clock dependence; scenarios replay exactly
//!
//! ## Quick Start
//!
//! ```rust
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! use ecallsim::config::EcallConfig;
//! use ecallsim::ecall::{EcallSession, EcallStateMachine};
//! use ecallsim::service::SimulatedCallService;
//!
//! let config = EcallConfig::default();
//! let service = Rc::new(RefCell::new(SimulatedCallService::new(&config)));
//!
//! let mut ecall = EcallStateMachine::new(service.clone(), EcallSession::from_config(&config));
//! ecall.start();
//! ecall.run_until_idle();
//!
//! println!("{}", ecall.active_chain());
//! ```
//!
//! ## Architecture
//!
//! - [`machine`] - Generic hierarchical state-machine engine
//! - [`ecall`] - The eCall protocol states and top-level machine
//! - [`event`] - Protocol event value type
//! - [`timers`] - HLAP timer table and expiry watchdog
//! - [`service`] - Call-service collaborator interface and simulation
//! - [`config`] - Session, redial and timer configuration

pub mod config;
pub mod ecall;
pub mod event;
pub mod machine;
pub mod service;
pub mod timers;

// Re-export main public types for convenience
pub use config::{EcallConfig, RedialPolicy};
pub use ecall::{EcallSession, EcallStateMachine};
pub use event::Event;
pub use machine::{State, StateMachine};
pub use service::{CallService, SimulatedCallService};
pub use timers::TimerId;
