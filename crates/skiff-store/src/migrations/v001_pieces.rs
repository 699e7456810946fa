//! v001 -- Piece table.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS pieces (
    file_id     TEXT    NOT NULL,             -- UUID v4
    piece_index INTEGER NOT NULL,
    data        BLOB    NOT NULL,
    PRIMARY KEY (file_id, piece_index)
);
"#;

/// Apply the migration.
pub fn up(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(UP_SQL)
}
