//! Table and index definitions.
//!
//! Every statement is idempotent, so [`migrate`](crate::PostgresObjStorage::migrate)
//! can run on each start.

/// DDL for the objects table named `table`, in execution order.
pub(crate) fn statements(table: &str) -> Vec<String> {
    vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                app_id TEXT NOT NULL,
                group_id TEXT NOT NULL,
                tag TEXT NOT NULL,
                obj_record JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                created_by TEXT NOT NULL,
                created_by_type TEXT NOT NULL,
                updated_by TEXT NOT NULL,
                updated_by_type TEXT NOT NULL,
                deleted_at TIMESTAMPTZ,
                deleted_by TEXT,
                deleted_by_type TEXT,
                should_index BOOLEAN NOT NULL DEFAULT TRUE,
                fields_to_index TEXT[]
            )"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {table}_scope_idx \
             ON {table} (app_id, group_id, tag, created_at DESC)"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {table}_tag_updated_idx \
             ON {table} (app_id, tag, updated_at DESC)"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {table}_tag_deleted_idx \
             ON {table} (app_id, tag, deleted_at)"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {table}_created_by_idx \
             ON {table} (app_id, created_by)"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {table}_updated_by_idx \
             ON {table} (app_id, updated_by)"
        ),
        // Indexing workers poll for objects changed since their last pass.
        format!(
            "CREATE INDEX IF NOT EXISTS {table}_should_index_idx \
             ON {table} (should_index, updated_at)"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {table}_purge_idx \
             ON {table} (deleted_at) WHERE deleted_at IS NOT NULL"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {table}_record_idx \
             ON {table} USING GIN (obj_record jsonb_path_ops)"
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::COLUMNS;

    #[test]
    fn every_statement_is_idempotent() {
        for statement in statements("objs") {
            assert!(statement.contains("IF NOT EXISTS objs"), "{statement}");
        }
    }

    #[test]
    fn table_defines_every_selected_column() {
        let create = &statements("objs")[0];
        for column in COLUMNS.split(", ") {
            assert!(create.contains(&format!("\n                {column} ")), "{column}");
        }
        assert!(create.contains("DEFAULT '{}'::jsonb"));
    }

    #[test]
    fn indexes_cover_timestamps_audit_and_indexing_flag() {
        let indexes: Vec<String> = statements("objs").into_iter().skip(1).collect();
        for columns in [
            "(app_id, group_id, tag, created_at DESC)",
            "(app_id, tag, updated_at DESC)",
            "(app_id, created_by)",
            "(app_id, updated_by)",
            "(should_index, updated_at)",
            "(deleted_at)",
        ] {
            assert!(indexes.iter().any(|i| i.contains(columns)), "no index on {columns}");
        }
    }

    #[test]
    fn index_names_are_distinct() {
        let statements = statements("objs");
        let names: std::collections::HashSet<&str> =
            statements.iter().skip(1).filter_map(|s| s.split_whitespace().nth(5)).collect();
        assert_eq!(names.len(), statements.len() - 1);
    }
}
