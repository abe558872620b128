// Copyright 2025 RISC Zero, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use clap::Parser;
use gas_refund::{
    boost::{BoostProvider, HttpBoostProvider, NoBoost},
    indexing::RefundCandidate,
    pricing::{Last24hAvgPriceResolver, PriceHistory},
    EventSource, ProgramConfig, RpcEventSource,
};
use gas_refund_indexer::{
    db::RefundsDb,
    service::{GasRefundService, GasRefundServiceConfig},
};
use serde::Deserialize;
use url::Url;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// DB connection string.
    #[clap(long, env = "DATABASE_URL")]
    db: String,

    /// RPC URLs, one per configured chain.
    #[clap(long = "rpc-url", env = "RPC_URLS", value_delimiter = ',', required = true)]
    rpc_urls: Vec<Url>,

    /// Epoch to process. Defaults to the epoch in progress.
    #[clap(long)]
    epoch: Option<u64>,

    /// TOML file with program config overrides.
    #[clap(long)]
    config: Option<PathBuf>,

    /// JSON file with the candidate transactions of the epoch.
    #[clap(long)]
    candidates: PathBuf,

    /// JSON file with reward token and chain currency USD price samples.
    #[clap(long)]
    prices: PathBuf,

    /// Base URL of the boost API. Boosts are disabled when unset.
    #[clap(long, env = "BOOST_API_URL")]
    boost_url: Option<Url>,

    /// Store the distribution and finalize the epoch if it has fully elapsed.
    #[clap(long, default_value_t = false)]
    finalize: bool,

    /// Seconds to wait between retries.
    #[clap(long, default_value = "30")]
    retry_delay: u64,

    /// Number of retries before quitting after an error.
    #[clap(long, default_value = "3")]
    retries: u32,

    /// Whether to log in JSON format.
    #[clap(long, env, default_value_t = false)]
    log_json: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PriceFile {
    reward_token: PriceHistory,
    chain_currency: PriceHistory,
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &PathBuf) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        .from_env_lossy();

    if args.log_json {
        tracing_subscriber::fmt().with_ansi(false).json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_ansi(false).with_env_filter(filter).init();
    }

    let program = match &args.config {
        Some(path) => ProgramConfig::load(path)?,
        None => ProgramConfig::default(),
    };
    let candidates: Vec<RefundCandidate> = read_json(&args.candidates)?;
    let prices: PriceFile = read_json(&args.prices)?;
    tracing::info!(
        "Loaded {} candidates, {} reward token and {} chain currency price samples",
        candidates.len(),
        prices.reward_token.len(),
        prices.chain_currency.len()
    );

    let mut sources: Vec<Arc<dyn EventSource>> = Vec::with_capacity(args.rpc_urls.len());
    for url in &args.rpc_urls {
        let source = RpcEventSource::connect(url.clone())
            .await
            .with_context(|| format!("failed to connect to {url}"))?;
        tracing::info!("Connected to chain {}", source.chain_id());
        sources.push(Arc::new(source));
    }

    let boosts: Arc<dyn BoostProvider> = match &args.boost_url {
        Some(url) => Arc::new(HttpBoostProvider::new(url.clone(), program.program.boost_start_epoch)),
        None => Arc::new(NoBoost),
    };

    let epoch = match args.epoch {
        Some(epoch) => epoch,
        None => {
            let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH)?.as_secs();
            program
                .epochs
                .epoch_for_timestamp(now.saturating_sub(program.calc_time_offset_secs))
                .context("current time predates the epoch calendar")?
        }
    };

    let db = RefundsDb::new(&args.db).await?;
    let service = GasRefundService::new(
        db,
        program,
        sources,
        Arc::new(Last24hAvgPriceResolver::new(prices.reward_token, prices.chain_currency)),
        boosts,
        GasRefundServiceConfig { finalize: args.finalize },
    )?;

    let mut failures = 0u32;
    loop {
        match service.run_epoch(epoch, &candidates).await {
            Ok(run) => {
                tracing::info!(
                    "Epoch {} done: {} inserted, {} validated, {} rejected, finalized: {}",
                    run.epoch,
                    run.inserted,
                    run.validation.validated,
                    run.validation.rejected,
                    run.finalized
                );
                return Ok(());
            }
            Err(e) => {
                failures += 1;
                tracing::error!("Error processing epoch {}: {:?}", epoch, e);
                if failures >= args.retries {
                    bail!("Maximum retries reached");
                }
                tracing::info!("Retrying in {} seconds", args.retry_delay);
                tokio::time::sleep(Duration::from_secs(args.retry_delay)).await;
            }
        }
    }
}
