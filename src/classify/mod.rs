// Classification module
//
// Turns inbound paths and upstream URLs into bounded, low-cardinality labels.

pub mod route;
pub mod source;

pub use route::{RequestClass, Route, RouteClassifier};
pub use source::SourceClassifier;
