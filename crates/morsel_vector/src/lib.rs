pub mod array;
pub mod batch;
pub mod bitmap;
pub mod builder;
pub mod field;
pub mod ipc;
pub mod scalar;
pub mod size;
pub mod testutil;
