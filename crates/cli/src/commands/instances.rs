// Pool startup check

use anyhow::{Context, Result};
use serde::Serialize;
use torpool::{InstanceSpec, PoolConfig, TorPool};

use crate::output::{print_table_header, print_table_row, OutputFormat};

#[derive(Debug, Serialize)]
struct InstanceRow {
    index: usize,
    socks: String,
    control: String,
    pid: Option<u32>,
    data_dir: String,
}

impl InstanceRow {
    fn new(spec: &InstanceSpec, pid: Option<u32>) -> Self {
        Self {
            index: spec.index,
            socks: spec.proxy_addr().to_string(),
            control: spec.control_addr().to_string(),
            pid,
            data_dir: spec.data_dir().display().to_string(),
        }
    }
}

pub async fn run(config: PoolConfig, format: OutputFormat, quiet: bool) -> Result<()> {
    if !quiet && format.is_text() {
        eprintln!("Starting {} Tor instance(s)...", config.instances);
    }
    let mut pool = TorPool::open(config)
        .await
        .context("Failed to start Tor pool")?;

    let rows: Vec<InstanceRow> = pool
        .instances()
        .iter()
        .zip(pool.pids())
        .map(|(spec, pid)| InstanceRow::new(spec, pid))
        .collect();

    pool.shutdown().await;

    if !format.is_text() {
        return format.print_value(&rows);
    }

    print_table_header(&[
        ("INDEX", 5),
        ("SOCKS", 21),
        ("CONTROL", 21),
        ("PID", 8),
        ("DATA DIR", 50),
    ]);
    for row in &rows {
        let index = row.index.to_string();
        let pid = row.pid.map_or_else(|| "-".to_string(), |p| p.to_string());
        print_table_row(&[
            (&index, 5),
            (&row.socks, 21),
            (&row.control, 21),
            (&pid, 8),
            (&row.data_dir, 50),
        ]);
    }
    if !quiet {
        println!();
        println!("{} instance(s) bootstrapped and stopped", rows.len());
    }

    Ok(())
}
