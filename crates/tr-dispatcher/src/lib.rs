//! Per-environment task-run dispatcher: bridges a durable queue and
//! websocket-connected remote worker processes. Each authenticated
//! connection owns one [`dispatch_loop::DispatchLoop`] pulling from its
//! environment's queue and one [`completion::CompletionHandler`] reacting
//! to messages the worker sends back.

pub mod completion;
pub mod contracts;
pub mod dispatch_loop;
pub mod memory;
pub mod model;
pub mod registry;
pub mod trace_recorder;
pub mod trace_window;
pub mod transport;
