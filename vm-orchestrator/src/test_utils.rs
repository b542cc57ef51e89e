use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use vm_hypervisor::mock::MockGateway;
use vm_hypervisor::{RemoteVmConfig, RemoteVmId};

/// Helper to create an in-memory test database with migrations applied
pub async fn create_test_db() -> SqlitePool {
    // A single connection keeps every query on the same in-memory database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

/// Remote id of the template seeded by [`mock_cluster`].
pub const TEMPLATE_ID: RemoteVmId = 9000;

/// A mock cluster holding one Ubuntu template with a 10G `scsi0` disk.
pub fn mock_cluster() -> MockGateway {
    MockGateway::new().with_vm(
        TEMPLATE_ID,
        RemoteVmConfig::default()
            .with("name", "ubuntu-2404-cloud")
            .with("cores", "1")
            .with("memory", "1024")
            .with("scsi0", "local-lvm:base-9000-disk-0,size=10G"),
    )
}
