pub use tandem_live::prelude::*;

// vim: ts=4
