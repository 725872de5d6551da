use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use prodqueue::class::parse_feedtype;
use prodqueue::{
    CreateOptions, Direction, Error, Product, ProductClass, ProductInfo, ProductQueue,
    ProductSpec, QueueConfig, Signature, Step, SuspendGuard, Timestamp,
};
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

#[derive(Parser)]
#[command(name = "pq", version, about = "Product-queue tooling")]
struct Cli {
    /// Queue file.
    #[arg(short = 'q', long = "queue", global = true, default_value = "ldm.pq")]
    queue: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new queue file.
    Create {
        /// Data segment size in bytes.
        #[arg(long = "size")]
        size: u64,
        /// Product slots; defaults to one per 4 KiB of data.
        #[arg(long = "slots")]
        slots: Option<u64>,
        #[arg(long = "align", default_value_t = 8)]
        align: u64,
        /// Replace an existing file.
        #[arg(short = 'f', long = "force")]
        force: bool,
    },
    /// Insert files as products.
    Insert {
        files: Vec<PathBuf>,
        #[arg(long = "feedtype", default_value = "ANY")]
        feedtype: String,
        #[arg(long = "origin")]
        origin: Option<String>,
        #[arg(long = "seqno", default_value_t = 0)]
        seqno: u32,
    },
    /// Print the metadata of queued products, oldest first.
    Cat {
        #[arg(long = "feedtype", default_value = "ANY")]
        feedtype: String,
        #[arg(long = "pattern", default_value = ".*")]
        pattern: String,
        /// Start after the newest product.
        #[arg(long = "from-end")]
        from_end: bool,
        /// Keep waiting for new products.
        #[arg(long = "follow")]
        follow: bool,
        #[arg(long = "limit")]
        limit: Option<usize>,
    },
    /// Print usage statistics.
    Mon {
        #[arg(long = "json")]
        json: bool,
    },
    /// Validate the queue and report its writers.
    Check {
        /// Reset the writer count left behind by crashed writers.
        #[arg(long = "clear-write-count")]
        clear_write_count: bool,
    },
    /// Delete one product.
    Delete {
        #[arg(long = "signature")]
        signature: Signature,
    },
    /// Evict the oldest products.
    Expire {
        #[arg(long = "count", default_value_t = 1)]
        count: u64,
    },
}

#[derive(Serialize)]
struct MonReport {
    path: String,
    data_size: u64,
    slots: u64,
    products: u64,
    bytes: u64,
    free_regions: u64,
    empty_slots: u64,
    max_free_extent: u64,
    max_products: u64,
    max_bytes: u64,
    highwater: u64,
    oldest_age_secs: f64,
    most_recent: Option<String>,
    is_full: bool,
    min_residence_secs: Option<f64>,
    min_residence_bytes: i64,
    min_residence_slots: u64,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            match err.downcast_ref::<Error>() {
                Some(pq_err) => {
                    if pq_err.is_corruption() {
                        eprintln!("queue is inconsistent");
                    }
                    ExitCode::from(pq_err.exit_code() as u8)
                }
                None => ExitCode::FAILURE,
            }
        }
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut out = io::BufWriter::new(io::stdout());
    match cli.command {
        Commands::Create {
            size,
            slots,
            align,
            force,
        } => cmd_create(&cli.queue, size, slots, align, force)?,
        Commands::Insert {
            files,
            feedtype,
            origin,
            seqno,
        } => cmd_insert(&cli.queue, &files, &feedtype, origin, seqno)?,
        Commands::Cat {
            feedtype,
            pattern,
            from_end,
            follow,
            limit,
        } => cmd_cat(&cli.queue, &feedtype, &pattern, from_end, follow, limit, &mut out)?,
        Commands::Mon { json } => cmd_mon(&cli.queue, json, &mut out)?,
        Commands::Check { clear_write_count } => {
            cmd_check(&cli.queue, clear_write_count, &mut out)?;
        }
        Commands::Delete { signature } => {
            let queue = ProductQueue::open(&cli.queue, QueueConfig::default().quiet())?;
            queue.delete_by_signature(&signature)?;
            queue.close()?;
            writeln!(out, "deleted {signature}")?;
        }
        Commands::Expire { count } => cmd_expire(&cli.queue, count, &mut out)?,
    }
    out.flush()?;
    Ok(())
}

fn format_time(time: Timestamp) -> String {
    OffsetDateTime::from_unix_timestamp(time.sec)
        .ok()
        .and_then(|dt| dt.replace_microsecond(time.usec as u32).ok())
        .and_then(|dt| dt.format(&Rfc3339).ok())
        .unwrap_or_else(|| time.to_string())
}

fn cmd_create(path: &Path, size: u64, slots: Option<u64>, align: u64, force: bool) -> Result<()> {
    let options = CreateOptions {
        data_size: size,
        slots: slots.unwrap_or((size / 4096).max(16)),
        align,
        ..CreateOptions::default()
    };
    let config = QueueConfig {
        no_clobber: !force,
        ..QueueConfig::default()
    };
    let queue = ProductQueue::create(path, options, config)
        .with_context(|| format!("creating {}", path.display()))?;
    let geometry = queue.geometry()?;
    info!(
        "data segment {} bytes at {}, index {} bytes",
        geometry.data_size, geometry.data_offset, geometry.index_size
    );
    queue.close()?;
    Ok(())
}

fn cmd_insert(
    path: &Path,
    files: &[PathBuf],
    feedtype: &str,
    origin: Option<String>,
    seqno: u32,
) -> Result<()> {
    let feedtype = parse_feedtype(feedtype)?;
    let queue = ProductQueue::open(path, QueueConfig::default())?;
    for (i, file) in files.iter().enumerate() {
        let data = fs::read(file).with_context(|| format!("reading {}", file.display()))?;
        let ident = file.to_string_lossy().into_owned();
        let seqno = seqno.wrapping_add(i as u32);
        let mut product = Product::from_payload(ident, feedtype, seqno, data);
        if let Some(origin) = &origin {
            product.info.origin = origin.clone();
        }
        match queue.insert(&product) {
            Ok(()) => info!("inserted {} ({})", file.display(), product.info.signature),
            Err(Error::Duplicate) => warn!("{} already queued", file.display()),
            Err(err) => return Err(err).with_context(|| format!("inserting {}", file.display())),
        }
    }
    queue.close()?;
    Ok(())
}

fn print_info(out: &mut dyn Write, info: &ProductInfo) -> io::Result<()> {
    writeln!(
        out,
        "{} {:#010x} {:>8} {:>10} {} {} {}",
        format_time(info.arrival),
        info.feedtype,
        info.seqno,
        info.size,
        info.signature,
        info.origin,
        info.ident
    )
}

fn cmd_cat(
    path: &Path,
    feedtype: &str,
    pattern: &str,
    from_end: bool,
    follow: bool,
    limit: Option<usize>,
    out: &mut dyn Write,
) -> Result<()> {
    let spec = ProductSpec::new(parse_feedtype(feedtype)?, pattern)?;
    let class = ProductClass::new(Timestamp::ZERO, Timestamp::ENDT, vec![spec]);
    let queue = ProductQueue::open(path, QueueConfig::read_only())?;
    if from_end {
        queue.set_cursor(queue.most_recent()?)?;
    }
    let mut printed = 0usize;
    loop {
        if limit.is_some_and(|limit| printed >= limit) {
            break;
        }
        let guard = if follow {
            Some(SuspendGuard::block()?)
        } else {
            None
        };
        let mut seen = None;
        let step = queue.sequence(Direction::Forward, &class, |product| {
            seen = Some(product.info.clone());
            true
        })?;
        if let Some(info) = seen {
            print_info(out, &info)?;
            printed += 1;
        }
        if step == Step::End {
            let Some(guard) = guard else {
                break;
            };
            out.flush()?;
            guard.wait(Duration::from_secs(30), &[libc::SIGINT, libc::SIGTERM])?;
        }
    }
    queue.close()?;
    Ok(())
}

fn cmd_mon(path: &Path, json: bool, out: &mut dyn Write) -> Result<()> {
    let queue = ProductQueue::open(path, QueueConfig::read_only())?;
    let stats = queue.stats()?;
    let (highwater, _) = queue.highwater()?;
    let residence = queue.min_virtual_residence()?;
    let most_recent = queue.most_recent()?;
    let report = MonReport {
        path: path.display().to_string(),
        data_size: queue.data_size()?,
        slots: queue.slot_count()?,
        products: stats.products,
        bytes: stats.bytes,
        free_regions: stats.free_regions,
        empty_slots: stats.empty_slots,
        max_free_extent: stats.max_free_extent,
        max_products: stats.max_products,
        max_bytes: stats.max_bytes,
        highwater,
        oldest_age_secs: stats.oldest_age,
        most_recent: (!most_recent.is_none()).then(|| format_time(most_recent)),
        is_full: queue.is_full()?,
        min_residence_secs: (!residence.time.is_none())
            .then(|| residence.time.secs_since(Timestamp::ZERO)),
        min_residence_bytes: residence.bytes,
        min_residence_slots: residence.slots,
    };
    queue.close()?;
    if json {
        serde_json::to_writer(&mut *out, &report)?;
        writeln!(out)?;
        return Ok(());
    }
    writeln!(out, "queue:          {}", report.path)?;
    writeln!(out, "data size:      {} bytes, {} slots", report.data_size, report.slots)?;
    writeln!(out, "products:       {} ({} bytes)", report.products, report.bytes)?;
    writeln!(
        out,
        "free:           {} regions, {} empty slots, largest {} bytes",
        report.free_regions, report.empty_slots, report.max_free_extent
    )?;
    writeln!(
        out,
        "maximum:        {} products, {} bytes, highwater {}",
        report.max_products, report.max_bytes, report.highwater
    )?;
    writeln!(out, "oldest age:     {:.3} s", report.oldest_age_secs)?;
    writeln!(
        out,
        "most recent:    {}",
        report.most_recent.as_deref().unwrap_or("-")
    )?;
    writeln!(out, "full:           {}", report.is_full)?;
    match report.min_residence_secs {
        Some(secs) => writeln!(
            out,
            "min residence:  {secs:.3} s at {} bytes, {} products",
            report.min_residence_bytes, report.min_residence_slots
        )?,
        None => writeln!(out, "min residence:  -")?,
    }
    Ok(())
}

fn cmd_check(path: &Path, clear_write_count: bool, out: &mut dyn Write) -> Result<()> {
    let queue = ProductQueue::open(path, QueueConfig::read_only())?;
    let products = queue.check()?;
    queue.close()?;
    writeln!(out, "{}: {products} products, indexes consistent", path.display())?;
    if clear_write_count {
        let previous = ProductQueue::clear_write_count(path)?;
        writeln!(out, "write count was {previous}, now 0")?;
    } else {
        let count = ProductQueue::write_count(path)?;
        writeln!(out, "write count {count}")?;
        if count > 0 {
            warn!("{count} writer(s) registered; clear only if none is running");
        }
    }
    Ok(())
}

fn cmd_expire(path: &Path, count: u64, out: &mut dyn Write) -> Result<()> {
    let queue = ProductQueue::open(path, QueueConfig::default().quiet())?;
    let mut expired = 0;
    while expired < count {
        match queue.delete_oldest() {
            Ok(()) => expired += 1,
            Err(Error::NotFound) => break,
            Err(err) => return Err(err.into()),
        }
    }
    queue.close()?;
    writeln!(out, "expired {expired} product(s)")?;
    Ok(())
}
