pub mod bdry;
pub mod collision;
pub mod container;
pub mod csr;
pub mod distance;
pub mod error;
pub mod mesh;
pub mod output;
pub mod settings;
pub mod simulation;
pub mod source;
pub mod triangle;
