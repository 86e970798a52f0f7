pub mod cloneset;
pub mod deployflow;
