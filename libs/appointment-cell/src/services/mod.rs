pub mod conflict;
pub mod lifecycle;
pub mod locking;
pub mod store;
pub mod supabase_store;

pub use conflict::ConflictDetectionService;
pub use lifecycle::AppointmentLifecycleManager;
pub use locking::DoctorDayLocks;
pub use store::{AppointmentStore, InMemoryAppointmentStore, StoreError};
pub use supabase_store::SupabaseAppointmentStore;
