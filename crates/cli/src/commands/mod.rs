// CLI commands

pub mod hash;
pub mod instances;
pub mod ip;
