//! # RVOIP Dialer Engine
//!
//! The call-origination control plane of an outbound contact-center dialer.
//! Given active campaigns and a pool of leads it decides when and how many
//! calls to place, which trunk each call goes out on, drives every call
//! through its signaling lifecycle, and feeds route quality back into future
//! routing decisions.
//!
//! ## Architecture
//!
//! ```text
//!  ┌────────────────────┐   ┌──────────────────┐   ┌────────────────────┐
//!  │ AdmissionScheduler │   │    Dispatcher    │   │   TimerProcessor   │
//!  │   (250 ms tick)    │   │  (100 ms tick)   │   │   (500 ms tick)    │
//!  └─────────┬──────────┘   └───┬──────────┬───┘   └─────────┬──────────┘
//!            │      RateLimiter ┘          │ originate        │
//!            │      RouteHealthTable       ▼                  │
//!            │                  ┌──────────────────────┐      │
//!            │                  │  TelephonyAdapter    │      │
//!            │                  └──────────┬───────────┘      │
//!            │                    events   ▼ (bounded mpsc)   │
//!            │                  ┌──────────────────────┐      │
//!            │                  │   SignalReconciler   │      │
//!            │                  └──────────┬───────────┘      │
//!            ▼                             ▼                  ▼
//!  ┌─────────────────────────────────────────────────────────────────────┐
//!  │          CallStateMachine  (MASTER_TABLE + TimerPolicy)             │
//!  └─────────────────────────────────┬───────────────────────────────────┘
//!                                    ▼
//!  ┌─────────────────────────────────────────────────────────────────────┐
//!  │    DialerStore: SqliteStore | HttpStore (remote API) | MemoryStore  │
//!  └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use rvoip_dialer_engine::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<()> {
//! let config = DialerConfig::default();
//! let store = connect_store(&config.storage).await?;
//! let adapter = Arc::new(SimulatedAdapter::new(SimulationProfile::default()));
//!
//! let engine = Arc::new(DialerEngine::new(config, store, adapter));
//! engine.start().await?;
//! // ...
//! engine.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod config;
pub mod logging;
pub mod types;

pub mod state_table;
pub mod state_machine;
pub mod rate_limit;
pub mod route_health;

pub mod storage;
pub mod adapter;

pub mod scheduler;
pub mod dispatcher;
pub mod timer_sweep;
pub mod reconciler;

pub mod engine;
pub mod api;

pub use error::{DialerError, Result};
pub use config::DialerConfig;
pub use engine::{DialerEngine, EngineStatus};

pub mod prelude {
    pub use crate::{DialerConfig, DialerEngine, DialerError, EngineStatus, Result};

    pub use crate::adapter::{
        AdapterEvent, AdapterEventType, OriginateRequest, OriginateResult, ReconnectPolicy, SimulatedAdapter,
        SimulatedOutcome, SimulationProfile, TelephonyAdapter,
    };
    pub use crate::dispatcher::{DispatchOutcome, Dispatcher};
    pub use crate::rate_limit::{RateLimiter, TokenBucket};
    pub use crate::reconciler::SignalReconciler;
    pub use crate::route_health::{RouteHealth, RouteHealthTable};
    pub use crate::scheduler::{compute_budget, AdmissionScheduler, BudgetDecision};
    pub use crate::state_machine::{CallStateMachine, TransitionData, TransitionResult};
    pub use crate::state_table::{CallEvent, CallState, TimerPolicy};
    pub use crate::storage::{connect_store, DialerStore, HttpStore, MemoryStore, SqliteStore};
    pub use crate::timer_sweep::TimerProcessor;
    pub use crate::types::{
        AttemptId, CallAttempt, Campaign, CampaignId, DialerMode, Lead, OriginationJob, TimerType, Trunk, TrunkId,
    };

    pub use chrono::{DateTime, Utc};
}
