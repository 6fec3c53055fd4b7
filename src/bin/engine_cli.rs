//! Engine CLI
//!
//! Operator-facing binary for running the prediction-market engine
//! standalone and exercising its Command API from a terminal, without
//! standing up the HTTP layer.
//!
//! Ledger balances and the market registry are process-local: only the
//! command journal and the trade/settlement audit logs survive a
//! restart. A realistic session is therefore a sequence of commands run
//! inside one process, either piped in on stdin or read from `--script`,
//! rather than one `engine_cli` invocation per command:
//!
//!   $ engine_cli --db ./engine.db --script session.txt
//!
//! where `session.txt` looks like:
//!
//!   create-market --kind binary --outcomes YES,NO --cap 1000 --resolver 1
//!   deposit --user 2 --amount 2000000
//!   deposit --user 3 --amount 2000000
//!   transition --market 1 --state active
//!   submit --market 1 --user 2 --side buy --outcome 0 --price 6000 --size 10
//!   submit --market 1 --user 3 --side sell --outcome 0 --price 6000 --size 10
//!   settle --market 1 --outcome 0
//!   ledger-snapshot --user 2
//!   journal-status --market 1
//!
//! Blank lines and lines starting with `#` are skipped. With no
//! `--script`, commands are read from stdin one per line until EOF.

use anyhow::{bail, Context, Result};
use prediction_engine::config::EngineConfig;
use prediction_engine::market::amm::AmmConfig;
use prediction_engine::market::book::BookConfig;
use prediction_engine::market::coordinator::MarketCoordinator;
use prediction_engine::market::dispatch::SettlementDispatcher;
use prediction_engine::market::journal::Journal;
use prediction_engine::market::ledger::Ledger;
use prediction_engine::market::types::{
    EngineKind, Market, MarketKind, MarketState, Order, OrderKind, OrderState, Resolution, Side,
};
use prediction_engine::performance::queues::QueueRegistry;
use prediction_engine::resilience::circuit_breaker::CircuitRegistry;
use prediction_engine::resilience::slo::SloMonitor;
use prediction_engine::resilience::task_queue::TaskQueue;
use clap::{Parser, Subcommand};
use std::io::BufRead;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser, Debug)]
#[command(name = "engine_cli")]
#[command(about = "Run the prediction-market engine standalone and exercise its Command API")]
struct Args {
    /// Path to the engine's SQLite journal. Overrides
    /// `ENGINE_JOURNAL_DB_PATH` / the config file's `journal_db_path` when
    /// given.
    #[arg(long)]
    db: Option<String>,
    /// Read commands from this file instead of stdin.
    #[arg(long)]
    script: Option<String>,
}

/// One line of a session. Reusing `clap::Parser` per line (rather than
/// hand-splitting) keeps the argument syntax identical to a true one-shot
/// invocation, so a single command can be copy-pasted out of a script and
/// run standalone while debugging.
#[derive(Parser, Debug)]
#[command(name = "", no_binary_name = true)]
struct LineArgs {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new market, auto-assigning its id, and print it.
    CreateMarket {
        #[arg(long, value_enum)]
        kind: MarketKindArg,
        #[arg(long, value_delimiter = ',')]
        outcomes: Vec<String>,
        #[arg(long)]
        cap: u64,
        #[arg(long)]
        resolver: u64,
        #[arg(long)]
        accredited_only: bool,
        #[arg(long, default_value_t = 0)]
        close_time_ns: i64,
        /// Use the AMM engine instead of the order-book engine.
        #[arg(long)]
        amm: bool,
    },
    /// Deposit collateral into a user's ledger account.
    Deposit {
        #[arg(long)]
        user: u64,
        #[arg(long)]
        amount: i128,
    },
    Submit {
        #[arg(long)]
        market: u64,
        #[arg(long)]
        user: u64,
        #[arg(long, value_enum)]
        side: SideArg,
        #[arg(long, default_value_t = 0)]
        outcome: u16,
        #[arg(long, value_enum, default_value = "limit")]
        kind: OrderKindArg,
        #[arg(long)]
        price: Option<u32>,
        #[arg(long)]
        size: u64,
        #[arg(long)]
        accredited: bool,
    },
    Cancel {
        #[arg(long)]
        market: u64,
        #[arg(long)]
        order: u64,
    },
    Transition {
        #[arg(long)]
        market: u64,
        #[arg(long, value_enum)]
        state: MarketStateArg,
        #[arg(long)]
        resolved_outcome: Option<u16>,
        #[arg(long)]
        resolved_scalar_value: Option<i64>,
    },
    /// Resolve a market and settle it: pays every position holder against
    /// the ledger immediately, then hands the audit-log write to the Task
    /// Queue (see `market::dispatch`). Prefer this over `transition
    /// --state resolved` directly, which only flips the market's lifecycle
    /// state and leaves payouts to the caller.
    Settle {
        #[arg(long)]
        market: u64,
        #[arg(long)]
        outcome: u16,
        #[arg(long)]
        scalar_value: Option<i64>,
    },
    /// Quote an AMM swap without executing it: the input required to buy
    /// `size` shares of `outcome` at the pool's current reserves.
    Quote {
        #[arg(long)]
        market: u64,
        #[arg(long, default_value_t = 0)]
        outcome: u16,
        #[arg(long, value_enum)]
        side: SideArg,
        #[arg(long)]
        size: u64,
    },
    /// Print the journal's recorded trade and settlement counts for a
    /// market.
    JournalStatus {
        #[arg(long)]
        market: u64,
    },
    LedgerSnapshot {
        #[arg(long)]
        user: u64,
    },
    /// Print a market's cached metadata snapshot (kind, state, resolution).
    MarketInfo {
        #[arg(long)]
        market: u64,
    },
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum MarketKindArg {
    Binary,
    Categorical,
    Scalar,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum SideArg {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum OrderKindArg {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum MarketStateArg {
    Draft,
    Active,
    Paused,
    Resolved,
    Cancelled,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "engine_cli=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

struct Session {
    coordinator: MarketCoordinator,
    ledger: Arc<Ledger>,
    journal: Arc<Journal>,
    next_market_id: AtomicU64,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let cfg = EngineConfig::from_env();
    let db_path = args.db.unwrap_or_else(|| cfg.journal_db_path.clone());

    let journal = Arc::new(Journal::open(&db_path).with_context(|| format!("opening journal at {db_path}"))?);
    let ledger = Arc::new(Ledger::new(true));

    let task_queue = Arc::new(TaskQueue::new(cfg.task_queue.worker_count, Arc::new(QueueRegistry::new())));
    let circuits = Arc::new(CircuitRegistry::default());
    circuits.configure(prediction_engine::market::dispatch::SETTLEMENT_JOURNAL_DEPENDENCY, cfg.breaker);
    let slo = Arc::new(SloMonitor::default());
    slo.configure(prediction_engine::market::dispatch::SETTLEMENT_SLO, cfg.slo);
    let settlement = Arc::new(SettlementDispatcher::new(task_queue, circuits, slo, journal.clone()));

    // `recover` replays every journalled market back to its last known
    // state before the session accepts any new commands, so a restart
    // picks up exactly where the previous process left off (engine state
    // only — see `MarketCoordinator::recover`'s doc comment for the ledger
    // caveat).
    let coordinator = MarketCoordinator::recover_with_cache_config(ledger.clone(), journal.clone(), cfg.coordinator, cfg.cache)
        .with_context(|| "recovering markets from journal")?
        .with_settlement_dispatcher(settlement);
    let next_market_id = journal.list_market_ids()?.into_iter().max().unwrap_or(0) + 1;
    let mut session = Session { coordinator, ledger, journal, next_market_id: AtomicU64::new(next_market_id) };

    let lines: Box<dyn Iterator<Item = std::io::Result<String>>> = match &args.script {
        Some(path) => {
            let file = std::fs::File::open(path).with_context(|| format!("opening script {path}"))?;
            Box::new(std::io::BufReader::new(file).lines())
        }
        None => Box::new(std::io::stdin().lock().lines()),
    };

    for line in lines {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let tokens = trimmed.split_whitespace();
        match LineArgs::try_parse_from(tokens) {
            Ok(parsed) => {
                if let Err(e) = run_command(&mut session, parsed.command).await {
                    println!("error: {e}");
                }
            }
            Err(e) => println!("parse error: {e}"),
        }
    }

    Ok(())
}

async fn run_command(session: &mut Session, command: Commands) -> Result<()> {
    match command {
        Commands::CreateMarket { kind, outcomes, cap, resolver, accredited_only, close_time_ns, amm } => {
            if outcomes.len() < 2 {
                bail!("a market needs at least two outcome labels");
            }
            let market_id = session.next_market_id.fetch_add(1, Ordering::Relaxed);
            let market_kind = match kind {
                MarketKindArg::Binary => MarketKind::Binary,
                MarketKindArg::Categorical => MarketKind::Categorical,
                MarketKindArg::Scalar => MarketKind::Scalar,
            };
            let engine_kind = if amm { EngineKind::Amm } else { EngineKind::OrderBook };
            let mut market = Market::new(market_id, market_kind, engine_kind, outcomes, cap, accredited_only, close_time_ns, resolver);
            market.state = MarketState::Active;
            session.coordinator.create_market(market, BookConfig::default(), AmmConfig::default());
            println!("created market {market_id}");
        }
        Commands::Deposit { user, amount } => {
            session.ledger.deposit(user, amount);
            println!("deposited {amount} to user {user}; available = {}", session.ledger.snapshot(user).available);
        }
        Commands::Submit { market, user, side, outcome, kind, price, size, accredited } => {
            let Some(handle) = session.coordinator.handle(market) else { bail!("unknown market {market}") };
            let now = now_ns();
            let order = Order {
                id: 0,
                market_id: market,
                user_id: user,
                side: match side {
                    SideArg::Buy => Side::Buy,
                    SideArg::Sell => Side::Sell,
                },
                outcome,
                kind: match kind {
                    OrderKindArg::Market => OrderKind::Market,
                    OrderKindArg::Limit => OrderKind::Limit,
                },
                price,
                size,
                filled_size: 0,
                state: OrderState::Open,
                submit_time_ns: now,
                last_update_ns: now,
            };
            match handle.submit(order, accredited, Duration::from_millis(500)).await {
                Ok(result) => {
                    println!("order {} accepted, {} trade(s)", result.order_id, result.trades.len());
                    for t in &result.trades {
                        println!("  trade {}: {} shares @ {}", t.id, t.size, t.price);
                    }
                }
                Err(e) => println!("order rejected: {e}"),
            }
        }
        Commands::Cancel { market, order } => {
            let Some(handle) = session.coordinator.handle(market) else { bail!("unknown market {market}") };
            let result = handle.cancel(order).await;
            if result.noop {
                println!("cancel was a no-op (order unknown or already terminal)");
            } else {
                println!("cancelled, released {}", result.released_amount);
            }
        }
        Commands::Transition { market, state, resolved_outcome, resolved_scalar_value } => {
            let Some(handle) = session.coordinator.handle(market) else { bail!("unknown market {market}") };
            let target = match state {
                MarketStateArg::Draft => MarketState::Draft,
                MarketStateArg::Active => MarketState::Active,
                MarketStateArg::Paused => MarketState::Paused,
                MarketStateArg::Resolved => MarketState::Resolved,
                MarketStateArg::Cancelled => MarketState::Cancelled,
            };
            let resolution = resolved_outcome.map(|outcome| Resolution {
                outcome,
                scalar_value: resolved_scalar_value,
                resolved_at_ns: now_ns(),
            });
            match handle.transition(target, resolution).await {
                Ok(()) => println!("market {market} transitioned to {target:?}"),
                Err(e) => println!("transition rejected: {e}"),
            }
        }
        Commands::Settle { market, outcome, scalar_value } => {
            let resolution = Resolution { outcome, scalar_value, resolved_at_ns: now_ns() };
            match session.coordinator.resolve_and_settle(market, resolution).await {
                Ok(Some(task_id)) => println!("market {market} resolved, settlement queued as task {task_id}"),
                Ok(None) => println!("market {market} resolved, nothing to settle"),
                Err(e) => println!("settlement rejected: {e}"),
            }
        }
        Commands::Quote { market, outcome, side, size } => {
            let Some(handle) = session.coordinator.handle(market) else { bail!("unknown market {market}") };
            let side = match side {
                SideArg::Buy => Side::Buy,
                SideArg::Sell => Side::Sell,
            };
            match handle.quote_amm(outcome, size, side).await {
                Ok(quote) => println!("quote: {} required for {} shares", quote.required_input, quote.size),
                Err(e) => println!("quote rejected: {e}"),
            }
        }
        Commands::JournalStatus { market } => {
            println!("trades recorded: {}", session.journal.trade_count(market)?);
            println!("settlements recorded: {}", session.journal.settlement_count(market)?);
        }
        Commands::LedgerSnapshot { user } => {
            let snap = session.ledger.snapshot(user);
            println!("user {user}: available = {}, reserved = {}, total = {}", snap.available, snap.reserved, snap.total());
        }
        Commands::MarketInfo { market } => match session.coordinator.market_snapshot(market).await {
            Some(m) => println!("market {market}: kind={:?} state={:?} resolution={:?}", m.kind, m.state, m.resolution),
            None => println!("unknown market {market}"),
        },
    }
    Ok(())
}

fn now_ns() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
