//! Building blocks for [`clap`]-driven configuration of stream processing hosts.

pub mod processing;
