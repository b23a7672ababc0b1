//! Built-in table catalog for the churn / survival pipeline

use super::{ColumnDef, ColumnType, SchemaRegistry, TableSchema};

use ColumnType::{Boolean, Float, Integer, Period, Text};

fn experiment_fk(table: TableSchema) -> TableSchema {
    table.foreign_key("experiment_id", "experiments", "experiment_id")
}

pub(super) fn churn_tables() -> SchemaRegistry {
    let tables = [
        TableSchema::new("experiments")
            .description("Analysis runs with their training/backtest windows and cutoff")
            .column(ColumnDef::new("experiment_id", Integer).key())
            .column(ColumnDef::new("experiment_name", Text).required())
            .column(ColumnDef::new("training_from", Period).required())
            .column(ColumnDef::new("training_to", Period).required())
            .column(ColumnDef::new("backtest_from", Period).required())
            .column(ColumnDef::new("backtest_to", Period).required())
            .column(ColumnDef::new("cutoff", Period).required())
            .column(ColumnDef::new("model_type", Text).required())
            .column(ColumnDef::new("feature_set", Text))
            .column(ColumnDef::new("status", Text).required())
            .column(ColumnDef::new("created_at", Text).required()),
        TableSchema::new("files")
            .description("Imported source files")
            .column(ColumnDef::new("file_id", Integer).key())
            .column(ColumnDef::new("file_name", Text).required())
            .column(ColumnDef::new("source_type", Text))
            .column(ColumnDef::new("inserted_at", Text)),
        TableSchema::new("rawdata")
            .description("Monthly customer panel")
            .column(ColumnDef::new("customer_id", Integer).key())
            .column(ColumnDef::new("period", Period).key())
            .column(ColumnDef::new("file_id", Integer))
            .column(ColumnDef::new("is_active", Boolean))
            .column(ColumnDef::new("churn_period", Period))
            .foreign_key("file_id", "files", "file_id")
            .period_column("period")
            .outcome_column("churn_period"),
        experiment_fk(
            TableSchema::new("backtest_results")
                .description("Early-warning backtest scores per customer and month")
                .column(ColumnDef::new("customer_id", Integer).key())
                .column(ColumnDef::new("experiment_id", Integer).key())
                .column(ColumnDef::new("period", Period).key())
                .column(ColumnDef::new("churn_probability", Float).required())
                .column(ColumnDef::new("risk_level", Text))
                .column(ColumnDef::new("actual_churn", Integer))
                .period_column("period"),
        ),
        experiment_fk(
            TableSchema::new("customer_details")
                .description("Per-customer predictions under each threshold method")
                .column(ColumnDef::new("customer_id", Integer).key())
                .column(ColumnDef::new("experiment_id", Integer).key())
                .column(ColumnDef::new("last_active_period", Period).required())
                .column(ColumnDef::new("is_alive", Boolean))
                .column(ColumnDef::new("churn_probability", Float))
                .column(ColumnDef::new("threshold_optimal", Float))
                .column(ColumnDef::new("predicted_optimal", Boolean))
                .period_column("last_active_period"),
        ),
        experiment_fk(
            TableSchema::new("cox_prioritization_results")
                .description("Cox survival prioritization per customer")
                .column(ColumnDef::new("customer_id", Integer).key())
                .column(ColumnDef::new("experiment_id", Integer).key())
                .column(ColumnDef::new("cutoff_exclusive", Period).required())
                .column(ColumnDef::new("start_period", Period))
                .column(ColumnDef::new("last_alive_period", Period).required())
                .column(ColumnDef::new("churn_period", Period))
                .column(ColumnDef::new("p_event_6m", Float))
                .column(ColumnDef::new("p_event_12m", Float))
                .column(ColumnDef::new("rmst_12m", Float))
                .column(ColumnDef::new("rmst_24m", Float))
                .column(ColumnDef::new("months_to_live", Float))
                .column(ColumnDef::new("priority_score", Float))
                .period_column("last_alive_period")
                .outcome_column("churn_period"),
        ),
        experiment_fk(
            TableSchema::new("experiment_kpis")
                .description("Scalar KPIs recorded for an experiment")
                .column(ColumnDef::new("kpi_id", Integer).key())
                .column(ColumnDef::new("experiment_id", Integer).required())
                .column(ColumnDef::new("metric_name", Text).required())
                .column(ColumnDef::new("metric_value", Float))
                .column(ColumnDef::new("metric_type", Text))
                .column(ColumnDef::new("calculated_at", Text)),
        ),
        TableSchema::new("threshold_methods")
            .description("Lookup of threshold selection methods")
            .column(ColumnDef::new("method_id", Integer).key())
            .column(ColumnDef::new("method_name", Text).required())
            .column(ColumnDef::new("description", Text)),
        experiment_fk(
            TableSchema::new("churn_threshold_metrics")
                .description("Precision/recall per threshold method and data split")
                .column(ColumnDef::new("experiment_id", Integer).key())
                .column(ColumnDef::new("method_id", Integer).key())
                .column(ColumnDef::new("data_split", Text).key())
                .column(ColumnDef::new("threshold_value", Float).required())
                .column(ColumnDef::new("precision", Float))
                .column(ColumnDef::new("recall", Float))
                .column(ColumnDef::new("f1", Float))
                .foreign_key("method_id", "threshold_methods", "method_id"),
        ),
    ];

    // Consistency is asserted by `test_churn_default_catalog_is_consistent`.
    SchemaRegistry::from_trusted(tables)
}
