pub mod classification;
pub mod decision;
pub mod learning;
pub mod operation;
pub mod staging;
