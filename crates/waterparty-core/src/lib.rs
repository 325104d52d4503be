pub mod envelope;
pub mod errors;
pub mod ids;
pub mod models;

pub use envelope::{Envelope, InboundEvent};
pub use errors::{BackendError, EnvelopeError};
pub use ids::{ConnectionId, MessageId, RoomId, UserId};
