pub mod codec;
pub mod config;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod logging;
pub mod matching;
pub mod proxy;
pub mod series;
pub mod storage;
pub mod transform;
pub mod upstream;
