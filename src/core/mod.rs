// Core engine: session state, the call channel seam, both queue tiers, and error modeling.
pub mod channel;
pub mod error;
pub mod inner;
pub mod model;
pub mod queue;
pub mod session;
pub mod zone;
