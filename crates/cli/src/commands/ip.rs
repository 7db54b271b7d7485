// Exit address lookup through the pool

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use torpool::{
    flatten, PoolConfig, PoolError, RotationPolicy, TorPool, WorkContext, WorkFunction,
};
use tracing::info;

use crate::output::{print_table_header, print_table_row, OutputFormat};

pub const DEFAULT_URL: &str = "http://httpbin.org/ip";

pub struct IpOptions {
    pub requests: usize,
    pub url: String,
    pub rotate: bool,
    pub timeout: Duration,
}

/// One successful lookup
#[derive(Debug, Clone, Serialize)]
pub struct Lookup {
    pub instance: usize,
    pub user_agent: String,
    pub origin: String,
}

/// Row of the report, successful or not
#[derive(Debug, Serialize)]
struct Outcome {
    request: usize,
    #[serde(flatten)]
    lookup: Option<Lookup>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Fetches `url` and reads the caller's address from its `origin` field
pub struct IpLookup {
    url: String,
}

impl IpLookup {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl WorkFunction<usize> for IpLookup {
    type Output = Lookup;

    async fn call(&self, ctx: &WorkContext<'_>, _request: usize) -> Result<Lookup, PoolError> {
        let session = ctx.session();
        let body: serde_json::Value = session
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let origin = origin_of(&body)
            .ok_or_else(|| PoolError::Request(format!("{} returned no origin", self.url)))?;

        Ok(Lookup {
            instance: ctx.index(),
            user_agent: session.user_agent().to_string(),
            origin: origin.to_string(),
        })
    }
}

fn origin_of(body: &serde_json::Value) -> Option<&str> {
    body.get("origin").and_then(|v| v.as_str())
}

pub async fn run(
    config: PoolConfig,
    options: IpOptions,
    format: OutputFormat,
    quiet: bool,
) -> Result<()> {
    let rotation = if options.rotate {
        RotationPolicy::BeforeEachItem
    } else {
        RotationPolicy::Never
    };
    let dispatch = config
        .dispatch
        .clone()
        .with_rotation(rotation)
        .with_item_timeout(options.timeout);
    let config = config.with_dispatch(dispatch);

    if !quiet && format.is_text() {
        eprintln!("Starting {} Tor instance(s)...", config.instances);
    }
    let mut pool = TorPool::open(config)
        .await
        .context("Failed to start Tor pool")?;

    let lookup = IpLookup::new(options.url);
    let requests: Vec<usize> = (0..options.requests).collect();

    let batches = tokio::select! {
        batches = pool.dispatch(requests, &lookup) => Some(batches),
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            None
        }
    };
    pool.shutdown().await;

    let Some(batches) = batches else {
        bail!("Interrupted");
    };

    let outcomes: Vec<Outcome> = flatten(batches)
        .into_iter()
        .enumerate()
        .map(|(request, result)| match result {
            Ok(lookup) => Outcome {
                request,
                lookup: Some(lookup),
                error: None,
            },
            Err(e) => Outcome {
                request,
                lookup: None,
                error: Some(e.to_string()),
            },
        })
        .collect();

    if !format.is_text() {
        return format.print_value(&outcomes);
    }

    print_table_header(&[("REQUEST", 8), ("INSTANCE", 9), ("ORIGIN", 40)]);
    for outcome in &outcomes {
        let request = outcome.request.to_string();
        match (&outcome.lookup, &outcome.error) {
            (Some(lookup), _) => {
                let instance = lookup.instance.to_string();
                print_table_row(&[(&request, 8), (&instance, 9), (&lookup.origin, 40)]);
            }
            (None, error) => {
                let error = format!("error: {}", error.as_deref().unwrap_or("unknown"));
                print_table_row(&[(&request, 8), ("-", 9), (&error, 60)]);
            }
        }
    }

    if !quiet {
        let succeeded = outcomes.iter().filter(|o| o.lookup.is_some()).count();
        let distinct: HashSet<&str> = outcomes
            .iter()
            .filter_map(|o| o.lookup.as_ref())
            .map(|l| l.origin.as_str())
            .collect();
        println!();
        println!(
            "{succeeded}/{} requests succeeded, {} distinct exit address(es)",
            outcomes.len(),
            distinct.len()
        );
    }

    Ok(())
}
