//! Transport implementations for the EdgeLink agent.
//!
//! Each transport provides a [`TransportFactory`](el_node_sdk::TransportFactory)
//! that the composition root registers in a
//! [`TransportRegistry`](el_node_sdk::TransportRegistry).

pub mod memory;
pub mod websocket;

pub use memory::{memory_transport, ControllerConn, MemoryFactory, MemoryListener};
pub use websocket::{WebSocketClient, WebSocketFactory};
