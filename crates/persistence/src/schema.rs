pub(crate) const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS executors (
    executor_id     INTEGER PRIMARY KEY,
    name            TEXT NOT NULL UNIQUE,
    api_id          INTEGER NOT NULL,
    api_hash        TEXT NOT NULL,
    session_blob    TEXT NOT NULL UNIQUE,
    status          TEXT NOT NULL DEFAULT 'disconnected',
    users_total     INTEGER NOT NULL DEFAULT 0,
    active_users    INTEGER NOT NULL DEFAULT 0,
    last_message_ts INTEGER NOT NULL DEFAULT 0,
    proxy_scheme    TEXT,
    proxy_host      TEXT,
    proxy_port      INTEGER UNIQUE,
    proxy_user      TEXT,
    proxy_pass      TEXT,
    UNIQUE (api_id, api_hash)
);

CREATE TABLE IF NOT EXISTS users (
    user_id         INTEGER PRIMARY KEY,
    executor_id     INTEGER REFERENCES executors(executor_id),
    access_hash     INTEGER,
    username        TEXT UNIQUE,
    phone           TEXT,
    display_name    TEXT,
    info            TEXT NOT NULL DEFAULT '',
    contact         BOOLEAN NOT NULL DEFAULT 0,
    banned          BOOLEAN NOT NULL DEFAULT 0,
    crm             BOOLEAN NOT NULL DEFAULT 0,
    conversation_id TEXT,
    summary         TEXT,
    last_message_ts INTEGER NOT NULL DEFAULT 0,
    problems_count  INTEGER NOT NULL DEFAULT 0,
    problem         BOOLEAN NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_users_executor ON users(executor_id);
"#;
