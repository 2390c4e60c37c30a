pub mod timers;
pub mod transitions;
pub mod types;

pub use timers::TimerPolicy;
pub use types::*;

use lazy_static::lazy_static;
use std::sync::Arc;

lazy_static! {
    /// The master decision table shared by every state machine instance
    pub static ref MASTER_TABLE: Arc<MasterStateTable> = Arc::new(build_master_table());
}

fn build_master_table() -> MasterStateTable {
    let table = transitions::default_table();
    if let Err(errors) = table.validate() {
        tracing::error!("Default call state table failed validation: {:?}", errors);
    }
    tracing::debug!("Built call state table with {} transitions", table.len());
    table
}
