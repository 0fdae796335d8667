//! The fragscan binary: wires the fragment optimizer, the phase-1 worker
//! pool and the phase-2 stability profiler into one pipeline.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};

use fragscan::candidates::load_candidates;
use fragscan::engine::process::ProcessEngine;
use fragscan::engine::FragmentSettings;
use fragscan::fragment::{default_zones, select_best, EngineTester, RangeSearch, SearchConfig};
use fragscan::input::{Config, Opts};
use fragscan::pinger::{PingConfig, Pinger};
use fragscan::port_pool::PortPool;
use fragscan::results::ResultStore;
use fragscan::scanner::{PoolState, WorkerPool};
use fragscan::stability::{StabilityProfiler, StabilityResult};

fn print_banner() {
    println!(
        "{}",
        r"
  __
 / _|_ __ __ _  __ _ ___  ___ __ _ _ __
| |_| '__/ _` |/ _` / __|/ __/ _` | '_ \
|  _| | | (_| | (_| \__ \ (_| (_| | | | |
|_| |_|  \__,_|\__, |___/\___\__,_|_| |_|
               |___/                       "
            .cyan()
    );
    println!("{}", "Proxy endpoint scanner with fragment tuning.".bold());
    println!();
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut opts = Opts::read();
    let config = Config::read(opts.config_path.clone());
    opts.merge(&config);

    if !opts.no_banner {
        print_banner();
    }

    let Some(source) = opts.addresses.clone() else {
        bail!("no candidate source given; pass --addresses <CIDR or file>");
    };
    if opts.uuid.is_empty() {
        warn!("no --uuid given; engine configs will be rejected");
    }

    let engine = Arc::new(ProcessEngine::new(opts.engine.clone()));
    let ports = PortPool::new(opts.local_ports.0, opts.local_ports.1);
    let mut candidates = load_candidates(&source, &opts.candidate_options())?;
    info!("loaded {} candidates from {source}", candidates.len());

    // optional direct reachability pre-filter, no engine involved
    if opts.ping {
        let ping_store = Arc::new(ResultStore::new());
        let pinger = Pinger::new(
            PingConfig {
                threads: opts.threads,
                ..PingConfig::default()
            },
            Arc::clone(&ping_store),
            fragscan::scanner::CancelToken::new(),
        );
        pinger.run(&candidates).await;
        let reachable: Vec<String> = ping_store
            .successful()
            .into_iter()
            .map(|r| r.address)
            .collect();
        println!(
            "Ping pre-filter: {} of {} candidates reachable",
            reachable.len().to_string().green(),
            candidates.len()
        );
        candidates = reachable;
    }

    let fragment = if opts.optimize_fragment {
        optimize_fragment(&opts, &engine, &ports, &candidates).await?
    } else {
        opts.fragment_settings()
    };
    if let Some(settings) = &fragment {
        info!(
            "using fragment settings: packets={} length={} interval={}",
            settings.packets, settings.length, settings.interval
        );
    }

    // phase 1: concurrent connectivity scan
    let store = Arc::new(ResultStore::new());
    let progress = ProgressBar::new(candidates.len() as u64);
    progress.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
        )
        .context("bad progress template")?
        .progress_chars("#>-"),
    );
    let bar = progress.clone();
    let pool = WorkerPool::new(
        Arc::clone(&engine),
        Arc::clone(&ports),
        Arc::clone(&store),
        opts.scan_config(fragment.clone()),
    )
    .with_observer(Box::new(move |result| {
        bar.inc(1);
        if result.success {
            bar.set_message(format!("{} {}ms", result.address, result.latency_ms()));
        }
    }));
    pool.set_candidates(candidates);

    let pool = Arc::new(pool);
    let ctrlc_pool = Arc::clone(&pool);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping scan");
            ctrlc_pool.stop();
        }
    });

    let scan_outcome = pool.run().await;
    progress.finish_and_clear();
    if pool.state() == PoolState::Stopped {
        warn!("scan stopped early; partial results follow");
    } else {
        scan_outcome?;
    }

    print_scan_results(&store);

    // phase 2: sequential stability profiling of the survivors
    if opts.stability && pool.state() == PoolState::Completed {
        let survivors: Vec<String> = store
            .sorted_by_latency()
            .into_iter()
            .map(|r| r.address)
            .collect();
        if survivors.is_empty() {
            println!("{}", "No survivors to profile.".yellow());
        } else {
            let profiler = StabilityProfiler::new(
                Arc::clone(&engine),
                Arc::clone(&ports),
                opts.stability_config(fragment.clone()),
                pool.cancel_token(),
            );
            let profiles = profiler.run(&survivors).await?;
            print_stability_results(&profiles);
            if let Some(path) = &opts.json {
                let json =
                    serde_json::to_string_pretty(&profiles).context("serializing profiles")?;
                fs::write(path, json)
                    .with_context(|| format!("writing {}", path.display()))?;
                println!("Wrote stability profiles to {}", path.display());
            }
            return Ok(());
        }
    }

    if let Some(path) = &opts.json {
        let json = serde_json::to_string_pretty(&store.to_json()).context("serializing results")?;
        fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
        println!("Wrote results to {}", path.display());
    }
    Ok(())
}

/// Runs the golden-ratio range search against the first candidate and
/// returns the winning zone's settings, if any zone converged.
async fn optimize_fragment(
    opts: &Opts,
    engine: &Arc<ProcessEngine>,
    ports: &Arc<PortPool>,
    candidates: &[String],
) -> Result<Option<FragmentSettings>> {
    let Some(target) = candidates.first() else {
        bail!("fragment optimization needs at least one candidate");
    };
    println!(
        "Searching fragment settings against {}...",
        target.as_str().cyan()
    );

    let tester = EngineTester::new(
        Arc::clone(engine),
        Arc::clone(ports),
        opts.proxy_settings(),
        target,
        &opts.url,
        Duration::from_millis(opts.ready_timeout),
        Duration::from_millis(opts.timeout),
    );
    let search = RangeSearch::new(SearchConfig::default())?.with_observer(Box::new(|event| {
        let mark = if event.success {
            "ok".green()
        } else {
            "fail".red()
        };
        println!(
            "  [{}] try {:>2} {} size={} interval={} {}ms",
            event.zone,
            event.attempt,
            mark,
            event.size,
            event.interval,
            event.latency.as_millis()
        );
    }));
    let results = search.run(&default_zones(), &tester).await?;

    match select_best(&results) {
        Some(best) => {
            println!(
                "Best zone {}: {:.0}% success over {} tests",
                best.zone.green().bold(),
                best.success_ratio() * 100.0,
                best.total_tests
            );
            Ok(best.fragment_settings())
        }
        None => {
            println!(
                "{}",
                "No zone converged; scanning without fragmentation.".yellow()
            );
            Ok(None)
        }
    }
}

fn print_scan_results(store: &ResultStore) {
    let successes = store.sorted_by_latency();
    println!(
        "\nScan finished: {} of {} candidates reachable",
        successes.len().to_string().green().bold(),
        store.count()
    );
    for result in &successes {
        let mut line = format!(
            "{:<40} {:>6}ms",
            result.address.green(),
            result.latency_ms()
        );
        if let Some(loss) = result.packet_loss_pct {
            line.push_str(&format!("  loss {loss:>5.1}%"));
        }
        if let Some(down) = result.download_mbps {
            line.push_str(&format!("  down {down:>6.1} Mbps"));
        }
        if let Some(up) = result.upload_mbps {
            line.push_str(&format!("  up {up:>6.1} Mbps"));
        }
        println!("{line}");
    }
}

fn print_stability_results(profiles: &[StabilityResult]) {
    println!("\nStability profiles (best first):");
    for profile in profiles {
        let verdict = if profile.passed {
            "PASS".green().bold()
        } else {
            "FAIL".red().bold()
        };
        let jitter = profile
            .jitter_ms
            .map_or_else(|| "n/a".to_owned(), |j| format!("{j:.1}ms"));
        let mut line = format!(
            "{verdict} {:<40} score {:>5.1}  avg {:>6.1}ms  jitter {jitter:>8}  loss {:>5.1}%",
            profile.address, profile.score, profile.avg_latency_ms, profile.packet_loss_pct
        );
        if let Some(down) = profile.download_mbps {
            line.push_str(&format!("  down {down:>6.1} Mbps"));
        }
        if let Some(up) = profile.upload_mbps {
            line.push_str(&format!("  up {up:>6.1} Mbps"));
        }
        println!("{line}");
        if let Some(reason) = &profile.fail_reason {
            println!("     {}", reason.yellow());
        }
    }
}
