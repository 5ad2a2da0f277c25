pub mod analysis;
pub mod artifact;
pub mod document;
pub mod payload;
pub mod run;
pub mod taxonomy;
