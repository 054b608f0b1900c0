//! # Inputs
//!
//! Input definitions describe where events come from. The [`InputManager`] owns the
//! side-effecting part: it starts and stops one runtime per enabled definition and
//! keeps the webhook route table.
//!
//! | type       | runtime                                                  |
//! |------------|----------------------------------------------------------|
//! | `webhook`  | none; calls are matched by route at dispatch time        |
//! | `udp`      | one socket, one event per datagram                       |
//! | `tail`     | file or directory follower, one event per line           |
//! | `timer`    | fixed-interval ticks                                     |
//! | `loopback` | built in; carries workflow outputs back in as inputs     |
//!
//! Every event goes through the injected emit callback; the manager does not know
//! what happens downstream.

pub mod codec;
pub mod definition;
pub mod manager;
pub mod runtime;
pub mod tail;
pub mod timer;
pub mod udp;
pub mod webhook;

pub use codec::Codec;
pub use definition::{InputConfig, InputDefinition, InputType, LOOPBACK_INPUT_ID};
pub use manager::{InputError, InputManager, InputResult};
pub use runtime::{EmitFn, InputStatus};
pub use webhook::WebhookRoute;
