//! Pass-pipeline engine.
//!
//! # Data Flow
//! ```text
//! web(request) → [delete_length → timeout → x_headers → stream]
//! ws(request)  → [check_method_and_header → x_headers → stream]
//!
//! upstream head → [remove_hop_headers → rewrite_location → write_headers → write_status_code]
//! ```
//!
//! Passes run in order until one returns [`Signal::Halt`]. Callers splice
//! their own passes in by name with `before`/`after`.

pub mod pass;
pub mod registry;

pub use pass::{
    response_pass, web_pass, ws_pass, FnPass, ResponsePass, ResponsePassRef, Signal, WebPass, WebPassRef,
    WsPass, WsPassRef,
};
pub use registry::{Kind, Named, Pass, PassRegistry, Pipeline};
