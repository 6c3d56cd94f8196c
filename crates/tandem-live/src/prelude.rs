pub use tandem_types::prelude::*;

// vim: ts=4
