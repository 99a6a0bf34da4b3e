//! Idempotent schema bootstrap. Runs on every startup; safe to re-run.

pub const SCHEMA_SQL: &str = r#"
CREATE EXTENSION IF NOT EXISTS pgcrypto;

CREATE TABLE IF NOT EXISTS owners (
    id              BIGINT PRIMARY KEY,
    telegram_user_id BIGINT NOT NULL UNIQUE,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS bot_instances (
    id                  BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    owner_user_id       BIGINT NOT NULL,
    bot_id              BIGINT NOT NULL UNIQUE,
    bot_username        TEXT NOT NULL,
    display_name        TEXT,
    token_ciphertext    BYTEA NOT NULL,
    is_active           BOOLEAN NOT NULL DEFAULT true,
    deleted_at          TIMESTAMPTZ,
    created_at          TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS protected_groups (
    id                  BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    bot_instance_id     BIGINT NOT NULL REFERENCES bot_instances(id),
    group_id            BIGINT NOT NULL,
    owner_user_id       BIGINT NOT NULL,
    title               TEXT,
    enabled             BOOLEAN NOT NULL DEFAULT true,
    params              JSONB NOT NULL DEFAULT '{}'::jsonb,
    member_count        BIGINT,
    last_sync_at        TIMESTAMPTZ,
    UNIQUE (bot_instance_id, group_id)
);

CREATE TABLE IF NOT EXISTS enforced_channels (
    id                  BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    bot_instance_id     BIGINT NOT NULL REFERENCES bot_instances(id),
    channel_id          BIGINT NOT NULL,
    title               TEXT,
    username            TEXT,
    invite_link         TEXT,
    subscriber_count    BIGINT,
    UNIQUE (bot_instance_id, channel_id)
);

CREATE TABLE IF NOT EXISTS group_channel_links (
    group_id    BIGINT NOT NULL,
    channel_id  BIGINT NOT NULL,
    PRIMARY KEY (group_id, channel_id)
);

CREATE TABLE IF NOT EXISTS verification_logs (
    id                  BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    bot_instance_id     BIGINT NOT NULL,
    user_id             BIGINT NOT NULL,
    group_id            BIGINT NOT NULL,
    channel_id          BIGINT NOT NULL,
    status              TEXT NOT NULL,
    latency_ms          BIGINT NOT NULL,
    cached              BOOLEAN NOT NULL,
    error_type          TEXT,
    timestamp           TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS idx_verification_logs_bot_time
    ON verification_logs (bot_instance_id, timestamp DESC);

CREATE TABLE IF NOT EXISTS api_call_logs (
    id                  BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    bot_instance_id     BIGINT NOT NULL,
    method              TEXT NOT NULL,
    chat_id             BIGINT,
    user_id             BIGINT,
    success             BOOLEAN NOT NULL,
    latency_ms          BIGINT NOT NULL,
    error_category      TEXT,
    timestamp           TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS admin_commands (
    id                  UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    bot_instance_id     BIGINT NOT NULL,
    command_type        TEXT NOT NULL,
    payload             JSONB NOT NULL DEFAULT '{}'::jsonb,
    status              TEXT NOT NULL DEFAULT 'pending',
    error               TEXT,
    attempts            INTEGER NOT NULL DEFAULT 0,
    created_by          BIGINT,
    created_at          TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at          TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS idx_admin_commands_pending
    ON admin_commands (bot_instance_id, status, created_at)
    WHERE status = 'pending';

CREATE TABLE IF NOT EXISTS bot_status (
    bot_instance_id     BIGINT PRIMARY KEY,
    status              TEXT NOT NULL,
    started_at          TIMESTAMPTZ NOT NULL,
    last_heartbeat       TIMESTAMPTZ NOT NULL,
    uptime_seconds      BIGINT NOT NULL DEFAULT 0,
    last_error          TEXT
);

CREATE TABLE IF NOT EXISTS admin_audit_logs (
    id                  BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    bot_instance_id     BIGINT NOT NULL,
    actor_user_id       BIGINT,
    action              TEXT NOT NULL,
    group_id            BIGINT,
    target_user_id      BIGINT,
    details             JSONB NOT NULL DEFAULT '{}'::jsonb,
    timestamp           TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS idx_admin_audit_logs_bot_time
    ON admin_audit_logs (bot_instance_id, timestamp DESC);
"#;
