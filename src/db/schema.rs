/// Collections of the durable store, one table per entity.
pub const SCHEMA: &str = "
    -- Append-only message log
    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        group_id INTEGER NOT NULL,
        user_id INTEGER NOT NULL,
        bot_id INTEGER NOT NULL,
        raw_message TEXT NOT NULL,
        is_plain_text BOOLEAN NOT NULL DEFAULT TRUE,
        plain_text TEXT NOT NULL,
        keywords TEXT NOT NULL,
        time INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_messages_time ON messages (time DESC);

    -- Learned contexts; answers and bans are JSON documents
    CREATE TABLE IF NOT EXISTS contexts (
        keywords TEXT PRIMARY KEY,
        time INTEGER NOT NULL,
        count INTEGER NOT NULL DEFAULT 0,
        clear_time INTEGER NOT NULL DEFAULT 0,
        answers TEXT NOT NULL DEFAULT '[]',
        bans TEXT NOT NULL DEFAULT '[]'
    );
    CREATE INDEX IF NOT EXISTS idx_contexts_count ON contexts (count DESC);
    CREATE INDEX IF NOT EXISTS idx_contexts_time ON contexts (time DESC);

    -- (answer group, keywords) pairs for group scoped scans
    CREATE TABLE IF NOT EXISTS context_answers (
        group_id INTEGER NOT NULL,
        keywords TEXT NOT NULL,
        PRIMARY KEY (group_id, keywords)
    );

    CREATE TABLE IF NOT EXISTS blacklists (
        group_id INTEGER PRIMARY KEY,
        answers TEXT NOT NULL DEFAULT '[]',
        answers_reserve TEXT NOT NULL DEFAULT '[]'
    );
";
