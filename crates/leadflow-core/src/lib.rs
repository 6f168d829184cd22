pub mod claim;
pub mod config;
pub mod consultant;
pub mod cycle;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod intake;
pub mod lead;
pub mod notify;
pub mod paths;
pub mod pool;
pub mod queue;
pub mod store;
pub mod types;

pub use claim::{ClaimArbiter, ClaimOutcome};
pub use consultant::{Consultant, StaticWeights, WeightTable};
pub use cycle::{DispatchCycle, Popped};
pub use dispatch::Dispatcher;
pub use engine::Engine;
pub use error::{LeadflowError, Result};
pub use intake::LeadIntake;
pub use lead::{AssignmentRecord, Lead, NewLead, StalenessWindow};
pub use notify::{LogNotifier, Notifier, Notifiers, NotifyError};
pub use pool::PublicPool;
pub use store::{ConsultantRegistry, LeadDb, SqliteStore, Store, StoreBackend};
pub use types::{AssignmentKind, ConsultantId, LeadId, LeadStatus};
