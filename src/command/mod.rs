//! Command Layer
//!
//! Every store operation travels as a `Command`: a closed set of payloads
//! (SAVE, REMOVE, TOUCH, LOAD_REQUEST, LOAD_RESPONSE, REMOVE_EXPIRED,
//! SIMPLE_ACK, NOOP) addressed to one member or broadcast.
//!
//! ## Pieces
//! - **`codec`**: The bit-exact wire format.
//! - **`interceptor`**: The pluggable chain between handler and transport.
//! - **`manager`**: Sends commands out, and applies the ones that come in.
//! - **`mediator`**: Correlates responses (acks, load results) with waiters.

pub mod codec;
pub mod interceptor;
pub mod manager;
pub mod mediator;
pub mod types;
