//! Toy demo: resolves supplementary groups for a uid through an
//! `upcall_cache::Cache`, simulating the external resolver with a detached
//! thread that sleeps and then calls back via `downcall`.

use std::sync::{OnceLock, Weak};
use std::thread;
use std::time::Duration;

use clap::Parser;
use serde_json::json;
use upcall_cache::{Cache, CacheError, CacheOps, Entry};

/// Resolve supplementary groups for a uid and emit JSON.
#[derive(Parser, Debug)]
#[command(name = "upcall-cache-cli", about = "Resolve supplementary groups for a uid")]
struct Args {
    /// uid to resolve
    #[arg(long)]
    uid: u32,

    /// Simulate the upstream resolver reporting failure
    #[arg(long)]
    fail: bool,

    /// Milliseconds the simulated resolver takes to answer
    #[arg(long, default_value_t = 50)]
    delay_ms: u64,

    /// Seconds to wait for the upcall before giving up
    #[arg(long, default_value_t = 5)]
    acquire_expire_secs: i64,
}

type GroupsCache = Cache<Vec<u32>, u32, GroupsOps>;

struct GroupsOps {
    self_ref: OnceLock<Weak<GroupsCache>>,
    fail: bool,
    delay_ms: u64,
}

impl CacheOps<Vec<u32>, u32> for GroupsOps {
    fn do_upcall(&self, entry: &Entry<Vec<u32>>) -> Result<(), CacheError> {
        let key = entry.key();
        let weak = self
            .self_ref
            .get()
            .cloned()
            .expect("self_ref initialized before the first lookup");
        let fail = self.fail;
        let delay_ms = self.delay_ms;

        thread::spawn(move || {
            thread::sleep(Duration::from_millis(delay_ms));
            if let Some(cache) = weak.upgrade() {
                let err = if fail { 1 } else { 0 };
                let uid = key as u32;
                let _ = cache.downcall(err, key, &uid);
            }
        });
        Ok(())
    }

    fn parse_downcall(&self, _entry: &Entry<Vec<u32>>, args: &u32) -> Result<Vec<u32>, CacheError> {
        let uid = *args;
        Ok(vec![uid % 1000, (uid * 7) % 1000, (uid * 13) % 1000])
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .ok();

    let args = Args::parse();

    let cache = std::sync::Arc::new_cyclic(|weak| {
        let ops = GroupsOps {
            self_ref: OnceLock::new(),
            fail: args.fail,
            delay_ms: args.delay_ms,
        };
        ops.self_ref.set(weak.clone()).ok();
        Cache::new(
            "groups",
            "/usr/sbin/groups_upcall",
            16,
            3600,
            args.acquire_expire_secs,
            false,
            ops,
        )
    });

    let output = match cache.get_entry(args.uid as u64, &args.uid) {
        Ok(entry) => json!({
            "uid": args.uid,
            "groups": entry.payload().cloned().unwrap_or_default(),
            "error": null,
        }),
        Err(e) => json!({
            "uid": args.uid,
            "groups": null,
            "error": e.to_string(),
        }),
    };

    println!("{output}");
    // Exit 0 always; failures are encoded in the JSON, not the exit code.
}
