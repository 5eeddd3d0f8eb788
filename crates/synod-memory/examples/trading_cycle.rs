//! # Trading Cycle Demo
//!
//! Walks one simulated trading day through the memory and communication core:
//!
//! 1. Analysts write memories and broadcast their signals
//! 2. The portfolio manager runs a meeting and a private chat
//! 3. Each analyst's self-review is resolved against its own memory
//!
//! ## Run This Example
//!
//! ```bash
//! cargo run -p synod-memory --example trading_cycle
//!
//! # Same run on the workspace backend, with debug logs
//! SYNOD_BACKEND=workspace RUST_LOG=synod_memory=debug cargo run -p synod-memory --example trading_cycle
//! ```

use chrono::NaiveDate;
use synod_memory::{
    BackendKind, MemoryMetadata, MemoryMutation, MemorySystem, Recipients, ReflectionVerdict,
    SessionKind, SynodConfig,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let backend = match std::env::var("SYNOD_BACKEND").as_deref() {
        Ok("workspace") => BackendKind::Workspace,
        _ => BackendKind::KeyValue,
    };
    let system = MemorySystem::new(SynodConfig::default().with_backend(backend))?;
    system.initialize("demo-2024-03").await?;

    let day = NaiveDate::from_ymd_opt(2024, 3, 15).ok_or_else(|| anyhow::anyhow!("bad date"))?;
    let store = system.memory_store();
    let bus = system.notifications();
    let sessions = system.sessions();

    // ========================================
    // 1. MEMORIES AND SIGNALS
    // ========================================
    info!("=== Analysts record memories ===");

    let fundamentals = store.for_agent("fundamentals_analyst");
    fundamentals
        .add(
            "overweighted growth signals in Q1",
            MemoryMetadata::new("reflection").with_date(day).with_ticker("NVDA"),
        )
        .await?;
    fundamentals
        .add(
            "margins expanding faster than guidance",
            MemoryMetadata::new("observation").with_date(day).with_ticker("NVDA"),
        )
        .await?;

    store
        .add(
            "valuation_analyst",
            "discount to intrinsic value is narrowing",
            MemoryMetadata::new("observation").with_date(day).with_ticker("NVDA"),
        )
        .await?;

    bus.publish(
        "fundamentals_analyst",
        Recipients::Broadcast,
        "NVDA: bullish, confidence 0.7",
        Some(day),
    )
    .await?;
    bus.publish(
        "valuation_analyst",
        Recipients::agent("portfolio_manager"),
        "NVDA: neutral, valuation stretched",
        Some(day),
    )
    .await?;

    for record in bus.list_for("portfolio_manager", Some(day)).await? {
        info!(sequence = record.sequence, sender = %record.sender, "{}", record.content);
    }

    // ========================================
    // 2. MEETING AND PRIVATE CHAT
    // ========================================
    info!("=== Portfolio manager convenes ===");

    let meeting = sessions
        .open(
            SessionKind::Meeting,
            "portfolio_manager",
            ["fundamentals_analyst", "valuation_analyst"],
            "NVDA position sizing",
        )
        .await?;
    sessions
        .append_turn(&meeting, "fundamentals_analyst", 1, "growth momentum supports adding")
        .await?;
    sessions
        .append_turn(&meeting, "valuation_analyst", 1, "valuation stretched after the rally")
        .await?;
    sessions
        .append_turn(
            &meeting,
            "portfolio_manager",
            2,
            "growth momentum is real but valuation stretched, add half size",
        )
        .await?;

    let session = sessions.get(&meeting).await?;
    info!(
        rounds = session.round_count(),
        unreferenced = session.unreferenced_turns().len(),
        "Meeting transcript ready"
    );
    sessions.close(&meeting).await?;

    let chat = sessions
        .open(SessionKind::PrivateChat, "portfolio_manager", ["valuation_analyst"], "exit levels")
        .await?;
    sessions
        .append_turn(&chat, "portfolio_manager", 1, "where would you trim?")
        .await?;
    sessions
        .append_turn(&chat, "valuation_analyst", 1, "above 40x forward earnings")
        .await?;
    for turn in sessions.transcript(&chat).await? {
        info!(agent = %turn.agent_id, round = turn.round, "{}", turn.content);
    }

    // ========================================
    // 3. REFLECTION
    // ========================================
    info!("=== End of day reflection ===");

    let verdicts = vec![
        ReflectionVerdict::mutate(
            "fundamentals_analyst",
            Some(day),
            "growth call was early",
            MemoryMutation::update_auto(
                "growth signal weighting",
                "growth signals need confirmation from valuation",
            ),
        ),
        ReflectionVerdict::mutate(
            "valuation_analyst",
            Some(day),
            "nothing to revise about dividends",
            MemoryMutation::delete_auto("dividend payout history"),
        ),
        ReflectionVerdict::keep("portfolio_manager", Some(day), "sizing was right"),
    ];

    let summary = system.resolver().resolve_cycle(&verdicts).await?;
    println!("{}", summary.render());

    for hit in fundamentals.search("growth signal weighting", 1, None).await? {
        info!(score = hit.score, "Top memory now: {}", hit.record.content);
    }

    system.teardown().await?;
    Ok(())
}
