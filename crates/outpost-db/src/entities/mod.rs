//! Database entities

pub mod beacon;
pub mod beacon_task;
pub mod listener_job;

pub use beacon::Entity as Beacon;
pub use beacon_task::Entity as BeaconTask;
pub use listener_job::Entity as ListenerJob;

pub mod prelude {
    pub use super::beacon::Entity as Beacon;
    pub use super::beacon_task::Entity as BeaconTask;
    pub use super::listener_job::Entity as ListenerJob;
}
