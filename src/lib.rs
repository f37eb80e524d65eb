//! # class-enhancer
//!
//! Ahead-of-time and on-load bytecode enhancement for compiled Java classes.
//!
//! ## Architecture
//!
//! - **classfile**: Class file parsing and class-level attribute insertion
//! - **marker**: The in-class marker proving a unit was already enhanced
//! - **descriptor**: Per-unit record (original bytes, enhanced bytes, state)
//! - **cache**: Per-run descriptor cache with single-flight creation per name
//! - **eligibility**: Exemption and already-enhanced checks
//! - **enhancer**: Pass contract, the ordered chain and the sink capability
//! - **registry**: Builds a chain from configured registrations; built-in passes
//! - **scan**: Class tree walking
//! - **commit**: Atomic write-back of enhanced bytes
//! - **pipeline**: Per-unit processor and the batch driver
//! - **classpath**: Parent resolvers over directories and jar archives
//! - **loader**: On-demand enhancement at load time
//! - **ledger**: Persistent record of written units (LMDB via heed)
//! - **session**: Wires configuration into a processor, batch driver or loader
//! - **config**: Layered TOML configuration
//! - **logging**: Scoped subscriber installation

pub mod cache;
pub mod classfile;
pub mod classpath;
pub mod cli;
pub mod commit;
pub mod config;
pub mod descriptor;
pub mod eligibility;
pub mod enhancer;
pub mod error;
pub mod ledger;
pub mod loader;
pub mod logging;
pub mod marker;
pub mod pipeline;
pub mod registry;
pub mod scan;
pub mod session;
