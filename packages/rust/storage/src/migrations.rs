//! SQL migration definitions for the Pipewright database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a set of SQL statements executed as one batch.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: statuses, transitions, queue, history, jobs, runs, steps",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Canonical stage catalogue
CREATE TABLE IF NOT EXISTS statuses (
    code INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE
);

-- Legal stage graph
CREATE TABLE IF NOT EXISTS state_transitions (
    from_status INTEGER NOT NULL REFERENCES statuses(code),
    to_status   INTEGER NOT NULL REFERENCES statuses(code),
    is_manual   INTEGER NOT NULL DEFAULT 0,
    description TEXT,
    PRIMARY KEY (from_status, to_status, is_manual)
);

-- Content records travelling through the pipeline
CREATE TABLE IF NOT EXISTS queue_items (
    id                   TEXT PRIMARY KEY,
    url                  TEXT,
    status_code          INTEGER NOT NULL REFERENCES statuses(code),
    payload              TEXT NOT NULL DEFAULT '{}',
    origin               TEXT NOT NULL,
    current_run_id       TEXT,
    failure_count        INTEGER NOT NULL DEFAULT 0,
    last_failed_step     TEXT,
    last_error_message   TEXT,
    last_error_type      TEXT,
    last_error_signature TEXT,
    last_error_at        TEXT,
    retry_after          TEXT,
    discovered_at        TEXT NOT NULL,
    updated_at           TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_queue_items_status ON queue_items(status_code, discovered_at);

-- Audit trail of stage changes
CREATE TABLE IF NOT EXISTS status_history (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    queue_item_id TEXT NOT NULL REFERENCES queue_items(id) ON DELETE CASCADE,
    from_status   INTEGER NOT NULL,
    to_status     INTEGER NOT NULL,
    actor         TEXT NOT NULL,
    is_manual     INTEGER NOT NULL DEFAULT 0,
    changed_at    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_status_history_item ON status_history(queue_item_id);

-- Batch jobs, at most one running per agent
CREATE TABLE IF NOT EXISTS agent_jobs (
    id                 TEXT PRIMARY KEY,
    agent_name         TEXT NOT NULL,
    status             TEXT NOT NULL,
    total_items        INTEGER NOT NULL DEFAULT 0,
    processed_items    INTEGER NOT NULL DEFAULT 0,
    success_count      INTEGER NOT NULL DEFAULT 0,
    failed_count       INTEGER NOT NULL DEFAULT 0,
    current_item_id    TEXT,
    current_item_title TEXT,
    error_message      TEXT,
    started_at         TEXT NOT NULL,
    completed_at       TEXT
);

CREATE INDEX IF NOT EXISTS idx_agent_jobs_agent ON agent_jobs(agent_name, started_at);
CREATE UNIQUE INDEX IF NOT EXISTS idx_agent_jobs_one_running
    ON agent_jobs(agent_name) WHERE status = 'running';

-- Pipeline runs
CREATE TABLE IF NOT EXISTS pipeline_runs (
    id                TEXT PRIMARY KEY,
    queue_item_id     TEXT NOT NULL REFERENCES queue_items(id) ON DELETE CASCADE,
    trigger_kind      TEXT NOT NULL,
    status            TEXT NOT NULL,
    created_at        TEXT NOT NULL,
    completed_at      TEXT,
    total_tokens      INTEGER NOT NULL DEFAULT 0,
    total_cost_usd    REAL NOT NULL DEFAULT 0,
    replay_validation TEXT,
    replayed_at       TEXT
);

CREATE INDEX IF NOT EXISTS idx_pipeline_runs_status ON pipeline_runs(status, created_at);

-- Step attempts within a run
CREATE TABLE IF NOT EXISTS pipeline_step_runs (
    id              TEXT PRIMARY KEY,
    run_id          TEXT NOT NULL REFERENCES pipeline_runs(id) ON DELETE CASCADE,
    step_name       TEXT NOT NULL,
    attempt         INTEGER NOT NULL,
    status          TEXT NOT NULL,
    input_snapshot  TEXT,
    output          TEXT,
    error_message   TEXT,
    error_signature TEXT,
    started_at      TEXT NOT NULL,
    completed_at    TEXT,
    UNIQUE(run_id, step_name, attempt)
);

CREATE INDEX IF NOT EXISTS idx_step_runs_run ON pipeline_step_runs(run_id, started_at);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Seed stage catalogue and transition graph",
            sql: r#"
INSERT OR IGNORE INTO statuses (code, name) VALUES
    (100, 'discovered'),
    (110, 'to_fetch'),
    (111, 'fetching'),
    (112, 'fetched'),
    (120, 'to_score'),
    (121, 'scoring'),
    (122, 'scored'),
    (200, 'pending_enrichment'),
    (210, 'to_summarize'),
    (211, 'summarizing'),
    (212, 'summarized'),
    (220, 'to_tag'),
    (221, 'tagging'),
    (222, 'tagged'),
    (230, 'to_thumbnail'),
    (231, 'thumbnailing'),
    (232, 'thumbnailed'),
    (240, 'enriched'),
    (300, 'pending_review'),
    (310, 'in_review'),
    (320, 'editing'),
    (330, 'approved'),
    (400, 'published'),
    (410, 'updated'),
    (500, 'failed'),
    (510, 'unreachable'),
    (520, 'duplicate'),
    (530, 'irrelevant'),
    (540, 'rejected'),
    (599, 'dead_letter');

-- Automatic edges driven by agents
INSERT OR IGNORE INTO state_transitions (from_status, to_status, is_manual, description) VALUES
    (100, 110, 0, 'queue for fetch'),
    (110, 111, 0, 'start fetch'),
    (111, 112, 0, 'fetch succeeded'),
    (111, 120, 0, 'fetched, queue for screening'),
    (111, 110, 0, 'fetch retry'),
    (111, 510, 0, 'source unreachable'),
    (112, 120, 0, 'queue for screening'),
    (120, 121, 0, 'start screening'),
    (121, 122, 0, 'screening done'),
    (121, 210, 0, 'relevant, queue for summary'),
    (121, 120, 0, 'screening retry'),
    (121, 530, 0, 'not relevant'),
    (122, 210, 0, 'queue for summary'),
    (200, 210, 0, 'queue for summary'),
    (210, 211, 0, 'start summary'),
    (211, 212, 0, 'summary done'),
    (211, 220, 0, 'summarized, queue for tagging'),
    (211, 210, 0, 'summary retry'),
    (212, 220, 0, 'queue for tagging'),
    (220, 221, 0, 'start tagging'),
    (221, 222, 0, 'tagging done'),
    (221, 230, 0, 'tagged, queue for thumbnail'),
    (221, 220, 0, 'tagging retry'),
    (222, 230, 0, 'queue for thumbnail'),
    (230, 231, 0, 'start thumbnail'),
    (231, 232, 0, 'thumbnail done'),
    (231, 300, 0, 'thumbnailed, queue for review'),
    (231, 230, 0, 'thumbnail retry'),
    (232, 240, 0, 'enrichment complete'),
    (240, 300, 0, 'queue for review');

-- Rejections and dead-lettering from ready and working stages
INSERT OR IGNORE INTO state_transitions (from_status, to_status, is_manual, description) VALUES
    (111, 540, 0, 'rejected by agent'),
    (121, 540, 0, 'rejected by agent'),
    (211, 540, 0, 'rejected by agent'),
    (221, 540, 0, 'rejected by agent'),
    (231, 540, 0, 'rejected by agent'),
    (110, 599, 0, 'dead letter'),
    (111, 599, 0, 'dead letter'),
    (120, 599, 0, 'dead letter'),
    (121, 599, 0, 'dead letter'),
    (210, 599, 0, 'dead letter'),
    (211, 599, 0, 'dead letter'),
    (220, 599, 0, 'dead letter'),
    (221, 599, 0, 'dead letter'),
    (230, 599, 0, 'dead letter'),
    (231, 599, 0, 'dead letter');

-- Human review, publishing and operator overrides
INSERT OR IGNORE INTO state_transitions (from_status, to_status, is_manual, description) VALUES
    (300, 310, 1, 'reviewer picks up'),
    (310, 320, 1, 'reviewer edits'),
    (310, 330, 1, 'reviewer approves'),
    (310, 540, 1, 'reviewer rejects'),
    (320, 310, 1, 'back to review'),
    (330, 400, 1, 'publish'),
    (400, 410, 1, 'republish'),
    (410, 400, 1, 'update published'),
    (540, 300, 1, 'un-reject'),
    (530, 210, 1, 'override relevance'),
    (500, 110, 1, 'requeue failed'),
    (599, 110, 1, 'requeue for fetch'),
    (599, 120, 1, 'requeue for screening'),
    (599, 210, 1, 'requeue for summary'),
    (599, 220, 1, 'requeue for tagging'),
    (599, 230, 1, 'requeue for thumbnail');

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
        Migration {
            version: 3,
            description: "Idempotency keys on step attempts",
            sql: r#"
ALTER TABLE pipeline_step_runs ADD COLUMN idempotency_key TEXT;

CREATE INDEX IF NOT EXISTS idx_step_runs_idempotency ON pipeline_step_runs(run_id, idempotency_key);

INSERT INTO schema_migrations (version) VALUES (3);
"#,
        },
    ]
}
