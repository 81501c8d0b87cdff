//! Initial schema: listener jobs, beacons and beacon tasks

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // ============================================================
        // 1. Create listener_jobs table
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(ListenerJobs::Table)
                    .if_not_exists()
                    .col(integer(ListenerJobs::JobId).primary_key())
                    .col(string_len(ListenerJobs::Kind, 16).not_null())
                    .col(string_len(ListenerJobs::Protocol, 16).not_null())
                    .col(string_len(ListenerJobs::Host, 255).not_null())
                    .col(integer(ListenerJobs::Port).not_null())
                    .col(string_len(ListenerJobs::Profile, 255).not_null().default(""))
                    .col(blob_null(ListenerJobs::StageData))
                    .col(text_null(ListenerJobs::TlsCertPath))
                    .col(text_null(ListenerJobs::TlsKeyPath))
                    .col(
                        timestamp_with_time_zone(ListenerJobs::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 2. Create beacons table
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(Beacons::Table)
                    .if_not_exists()
                    .col(uuid(Beacons::Id).primary_key())
                    .col(string_len(Beacons::Name, 255).not_null())
                    .col(string_len(Beacons::Hostname, 255).not_null())
                    .col(string_len(Beacons::Username, 255).not_null())
                    .col(string_len(Beacons::Os, 32).not_null())
                    .col(string_len(Beacons::Arch, 32).not_null())
                    .col(string_len(Beacons::RemoteAddress, 255).not_null())
                    .col(string_len(Beacons::Transport, 16).not_null())
                    .col(big_integer(Beacons::IntervalSecs).not_null())
                    .col(big_integer(Beacons::JitterSecs).not_null().default(0))
                    .col(timestamp_with_time_zone(Beacons::LastCheckin).not_null())
                    .col(timestamp_with_time_zone(Beacons::NextCheckin).not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_beacons_name")
                    .table(Beacons::Table)
                    .col(Beacons::Name)
                    .to_owned(),
            )
            .await?;

        // ============================================================
        // 3. Create beacon_tasks table
        // ============================================================
        manager
            .create_table(
                Table::create()
                    .table(BeaconTasks::Table)
                    .if_not_exists()
                    .col(uuid(BeaconTasks::Id).primary_key())
                    .col(uuid(BeaconTasks::BeaconId).not_null())
                    .col(
                        string_len(BeaconTasks::State, 16)
                            .not_null()
                            .default("pending"),
                    )
                    .col(text(BeaconTasks::Description).not_null())
                    .col(
                        timestamp_with_time_zone(BeaconTasks::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(timestamp_with_time_zone_null(BeaconTasks::SentAt))
                    .col(timestamp_with_time_zone_null(BeaconTasks::CompletedAt))
                    .col(blob(BeaconTasks::Request).not_null())
                    .col(blob_null(BeaconTasks::Response))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_beacon_tasks_beacon_id")
                            .from(BeaconTasks::Table, BeaconTasks::BeaconId)
                            .to(Beacons::Table, Beacons::Id)
                            .on_delete(ForeignKeyAction::Cascade)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_beacon_tasks_beacon_id")
                    .table(BeaconTasks::Table)
                    .col(BeaconTasks::BeaconId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(BeaconTasks::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Beacons::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(ListenerJobs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ListenerJobs {
    #[sea_orm(iden = "listener_jobs")]
    Table,
    JobId,
    Kind,
    Protocol,
    Host,
    Port,
    Profile,
    StageData,
    TlsCertPath,
    TlsKeyPath,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Beacons {
    #[sea_orm(iden = "beacons")]
    Table,
    Id,
    Name,
    Hostname,
    Username,
    Os,
    Arch,
    RemoteAddress,
    Transport,
    IntervalSecs,
    JitterSecs,
    LastCheckin,
    NextCheckin,
}

#[derive(DeriveIden)]
enum BeaconTasks {
    #[sea_orm(iden = "beacon_tasks")]
    Table,
    Id,
    BeaconId,
    State,
    Description,
    CreatedAt,
    SentAt,
    CompletedAt,
    Request,
    Response,
}
