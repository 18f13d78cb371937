pub mod api_keys;
pub mod group_hourly_stats;
pub mod group_sub_groups;
pub mod groups;
pub mod hub_access_keys;
pub mod request_logs;
pub mod system_settings;

pub use api_keys::Entity as ApiKeys;
pub use group_hourly_stats::Entity as GroupHourlyStats;
pub use group_sub_groups::Entity as GroupSubGroups;
pub use groups::Entity as Groups;
pub use hub_access_keys::Entity as HubAccessKeys;
pub use request_logs::Entity as RequestLogs;
pub use system_settings::Entity as SystemSettings;
