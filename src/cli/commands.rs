//! CLI command definitions

use clap::{Parser, Subcommand};
use rpcbus::BindingKind;

#[derive(Parser)]
#[command(name = "rpcbus")]
#[command(about = "Request/response RPC over pub/sub brokers", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Per-call timeout in milliseconds
    #[arg(long, env = "RPCBUS_CALL_TIMEOUT_MS", default_value_t = 2000, global = true)]
    pub call_timeout_ms: u64,

    /// Delay between connect attempts in milliseconds
    #[arg(long, env = "RPCBUS_RETRY_WAIT_MS", default_value_t = 200, global = true)]
    pub retry_wait_ms: u64,

    /// Connect attempts before giving up
    #[arg(long, env = "RPCBUS_ATTEMPTS", default_value_t = 10, global = true)]
    pub attempts: u32,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a server and a client on an in-memory broker and issue calls
    ///
    /// Examples:
    ///   rpcbus demo --binding exchange --calls 500 --concurrency 16
    ///   rpcbus demo --binding log --handlers 4
    Demo {
        /// Transport binding: exchange or log
        #[arg(short, long, default_value = "exchange", value_parser = parse_binding)]
        binding: BindingKind,

        /// Number of calls to issue
        #[arg(short = 'n', long, default_value_t = 100)]
        calls: usize,

        /// Calls in flight at once
        #[arg(short, long, default_value_t = 8)]
        concurrency: usize,

        /// Handlers the server may run at once
        #[arg(long, default_value_t = 1)]
        handlers: usize,
    },

    /// Sever the broker halfway through a run and watch both sides recover
    Reconnect {
        /// Transport binding: exchange or log
        #[arg(short, long, default_value = "exchange", value_parser = parse_binding)]
        binding: BindingKind,

        /// Number of calls to issue, one every 50ms
        #[arg(short = 'n', long, default_value_t = 40)]
        calls: usize,
    },
}

fn parse_binding(s: &str) -> Result<BindingKind, String> {
    s.parse()
}
