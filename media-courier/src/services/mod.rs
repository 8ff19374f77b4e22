//! Service layer: the courier facade and the container that wires it.

pub mod container;
pub mod courier;

pub use container::ServiceContainer;
pub use courier::{
    CancelResult, ChoicesResult, CourierCollaborators, CourierService, CourierSettings, SubmitResult,
};
