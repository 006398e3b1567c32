use rusqlite::Connection;

pub fn migrate(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS transactions (
            hash         TEXT PRIMARY KEY,
            block_number INTEGER NOT NULL,
            timestamp_ms INTEGER NOT NULL,
            sender       TEXT NOT NULL,
            recipient    TEXT NOT NULL,
            amount       TEXT NOT NULL, -- decimal string, 6 fractional digits max
            contract     TEXT NOT NULL,
            confirmed    INTEGER NOT NULL DEFAULT 1
        );

        CREATE INDEX IF NOT EXISTS idx_transactions_time ON transactions(timestamp_ms);
        CREATE INDEX IF NOT EXISTS idx_transactions_sender ON transactions(sender, timestamp_ms);
        CREATE INDEX IF NOT EXISTS idx_transactions_recipient ON transactions(recipient, timestamp_ms);
        ",
    )?;
    Ok(())
}
