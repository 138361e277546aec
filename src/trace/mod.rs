//! The expression trace: variable records, the store and the builder.
//!
//! Front-end code talks to the tracer through [`Trace::append`] and the
//! operations around it; everything else in this module maintains the
//! bookkeeping that evaluation relies on (reference counts, the active
//! set and the dirty queue).

mod builder;
mod state;
mod var;

pub use state::{Trace, RESERVED};
pub use var::{EdgeCallback, Variable};
