//! CirrusKV admin tool
//!
//! Inspects a local database directory and the objects of a cloud mirror.

use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use cirruskv::cloud::{Bucket, CloudEnv, DEFAULT_BUCKET_PREFIX};
use cirruskv::db::WAL_DIR_NAME;
use cirruskv::manifest::VersionSet;
use cirruskv::wal::WalRecovery;
use cirruskv::{
    BucketOptions, CloudBackend, CloudOptions, ColumnFamilyDescriptor, ColumnFamilyOptions, Db,
    Options, ReadOptions, Result, DEFAULT_COLUMN_FAMILY_NAME,
};
use tracing_subscriber::{fmt, EnvFilter};

/// CirrusKV admin tool
#[derive(Parser, Debug)]
#[command(name = "cirrus-ctl")]
#[command(about = "Inspect CirrusKV databases and their cloud mirrors")]
#[command(version)]
struct Args {
    /// Database directory
    #[arg(short, long, default_value = "./cirrus_data")]
    path: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List column families recorded in the manifest
    Families,

    /// Print the manifest: families, tables and counters
    Manifest,

    /// Check the WAL segments without modifying them
    Wal,

    /// Get a value by key
    Get {
        /// The key to get
        key: String,

        /// Column family
        #[arg(long, default_value = DEFAULT_COLUMN_FAMILY_NAME)]
        cf: String,
    },

    /// Print key-value pairs in key order
    Scan {
        /// Column family
        #[arg(long, default_value = DEFAULT_COLUMN_FAMILY_NAME)]
        cf: String,

        /// First key to print
        #[arg(long)]
        from: Option<String>,

        /// Maximum number of pairs
        #[arg(long, default_value = "100")]
        limit: usize,
    },

    /// List objects in a bucket of a local-filesystem mirror
    Objects {
        /// Directory holding the buckets
        #[arg(long)]
        root: PathBuf,

        /// Bucket suffix (the bucket is prefix + suffix)
        #[arg(long)]
        bucket: String,

        /// Object path inside the bucket
        #[arg(long, default_value = "")]
        object_path: String,

        #[arg(long, default_value = DEFAULT_BUCKET_PREFIX)]
        prefix: String,
    },
}

fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,cirruskv=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if let Err(e) = run(&args) {
        tracing::error!("{}", e);
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<()> {
    match &args.command {
        Commands::Families => {
            for name in Db::list_column_families(&args.path)? {
                println!("{}", name);
            }
        }

        Commands::Manifest => print_manifest(&args.path)?,

        Commands::Wal => {
            let result = WalRecovery::verify(&args.path.join(WAL_DIR_NAME))?;
            println!("segments:  {}", result.segments_replayed);
            println!("entries:   {}", result.entries_recovered);
            println!("last lsn:  {}", result.last_lsn);
            if result.torn_tail {
                println!("torn tail: {} bytes", result.bytes_truncated);
            }
        }

        Commands::Get { key, cf } => {
            let (db, handle) = open_family(&args.path, cf)?;
            let value = db.get_cf(&ReadOptions::default(), &handle, key.as_bytes())?;
            match value {
                Some(value) => println!("{}", String::from_utf8_lossy(&value)),
                None => println!("(not found)"),
            }
            drop(handle);
            db.close()?;
        }

        Commands::Scan { cf, from, limit } => {
            let (db, handle) = open_family(&args.path, cf)?;
            let mut iter = db.iterator_cf(&ReadOptions::default(), &handle)?;
            match from {
                Some(start) => iter.seek(start.as_bytes()),
                None => iter.seek_to_first(),
            }

            let mut printed = 0;
            while printed < *limit {
                let (Some(key), Some(value)) = (iter.key(), iter.value()) else {
                    break;
                };
                println!(
                    "{} => {}",
                    String::from_utf8_lossy(key),
                    String::from_utf8_lossy(value)
                );
                printed += 1;
                iter.next();
            }
            iter.status()?;
            drop(iter);
            drop(handle);
            db.close()?;
        }

        Commands::Objects {
            root,
            bucket,
            object_path,
            prefix,
        } => {
            let options = CloudOptions::new(CloudBackend::LocalFileSystem { root: root.clone() })
                .dest_bucket(BucketOptions::new(bucket.clone(), object_path.clone()).with_prefix(prefix.clone()));
            let env = CloudEnv::new(&options)?;
            for name in env.list_objects(Bucket::Dest)? {
                println!("{}", name);
            }
        }
    }
    Ok(())
}

fn print_manifest(path: &Path) -> Result<()> {
    let state = VersionSet::load(path)?;
    println!("last sequence:         {}", state.last_sequence);
    println!("next file number:      {}", state.next_file_number);
    println!("next column family id: {}", state.next_column_family_id);

    for cf in state.column_families.values() {
        println!();
        println!("[{}] {} (flushed through {})", cf.id, cf.name, cf.flushed_seq);
        for file in &cf.files {
            println!(
                "  {:06}.sst  {:>10} bytes  {:>8} entries  max_seq {:<10} [{} .. {}]",
                file.number,
                file.file_size,
                file.entry_count,
                file.max_seq,
                String::from_utf8_lossy(&file.smallest_key),
                String::from_utf8_lossy(&file.largest_key)
            );
        }
    }
    Ok(())
}

/// Open an existing database with all of its families
fn open_family(path: &Path, cf: &str) -> Result<(Db, cirruskv::ColumnFamilyHandle)> {
    let names = Db::list_column_families(path)?;
    let descriptors = names
        .into_iter()
        .map(|name| ColumnFamilyDescriptor::new(name, ColumnFamilyOptions::default()))
        .collect();

    let options = Options::builder().create_if_missing(false).build();
    let (db, handles) = Db::open_cf(&options, path, descriptors)?;

    match handles.into_iter().find(|h| h.name() == cf) {
        Some(handle) => Ok((db, handle)),
        None => Err(cirruskv::CirrusError::InvalidArgument(format!(
            "column family '{}' does not exist",
            cf
        ))),
    }
}
