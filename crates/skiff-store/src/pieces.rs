use rusqlite::params;

use skiff_shared::types::FileId;

use crate::database::Database;
use crate::error::Result;

impl Database {
    /// Store one piece. Re-putting the same index overwrites it.
    pub fn put_piece(&self, file_id: &FileId, piece_index: u32, data: &[u8]) -> Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO pieces (file_id, piece_index, data)
             VALUES (?1, ?2, ?3)",
            params![file_id.to_string(), piece_index, data],
        )?;
        Ok(())
    }

    /// All stored pieces of a file, ordered by index.
    pub fn pieces_for_file(&self, file_id: &FileId) -> Result<Vec<(u32, Vec<u8>)>> {
        let mut stmt = self.conn().prepare(
            "SELECT piece_index, data
             FROM pieces
             WHERE file_id = ?1
             ORDER BY piece_index ASC",
        )?;

        let rows = stmt.query_map(params![file_id.to_string()], |row| {
            Ok((row.get::<_, u32>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;

        let mut pieces = Vec::new();
        for row in rows {
            pieces.push(row?);
        }
        Ok(pieces)
    }

    pub fn count_pieces(&self, file_id: &FileId) -> Result<u32> {
        let count = self.conn().query_row(
            "SELECT COUNT(*) FROM pieces WHERE file_id = ?1",
            params![file_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Remove every piece of a file. Returns the number of rows deleted.
    pub fn delete_pieces_for_file(&self, file_id: &FileId) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM pieces WHERE file_id = ?1",
            params![file_id.to_string()],
        )?;
        Ok(affected)
    }
}
