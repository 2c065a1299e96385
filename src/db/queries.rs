use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};

use crate::db::Database;
use crate::errors::{LauncherError, Result};
use crate::models::{DownloadProgressUpdate, DownloadStatus, LocalDownload, LocalGame};

pub trait SettingsQueries: Send + Sync {
    fn set_setting(&self, key: &str, value: &str) -> Result<()>;
    fn get_setting(&self, key: &str) -> Result<Option<String>>;
    fn delete_setting(&self, key: &str) -> Result<()>;
}

pub trait GameQueries: Send + Sync {
    fn upsert_game(&self, game: &LocalGame) -> Result<()>;
    fn get_game(&self, game_id: &str) -> Result<Option<LocalGame>>;
    fn get_game_by_url(&self, url: &str) -> Result<Option<LocalGame>>;
    fn mark_game_installed(
        &self,
        game_id: &str,
        version: Option<&str>,
        install_path: &str,
        executable_path: Option<&str>,
    ) -> Result<()>;
}

pub trait DownloadQueries: Send + Sync {
    fn create_download(&self, download: &LocalDownload) -> Result<()>;
    fn get_download(&self, download_id: &str) -> Result<Option<LocalDownload>>;
    fn get_download_by_source(&self, source_url: &str) -> Result<Option<LocalDownload>>;
    fn get_download_by_info_hash(&self, info_hash: &str) -> Result<Option<LocalDownload>>;
    fn update_download_progress(
        &self,
        download_id: &str,
        update: &DownloadProgressUpdate,
    ) -> Result<()>;
    fn update_download_status(
        &self,
        download_id: &str,
        status: DownloadStatus,
        error_message: Option<&str>,
    ) -> Result<()>;
    fn set_download_info_hash(&self, download_id: &str, info_hash: &str) -> Result<()>;
    fn remove_download(&self, download_id: &str) -> Result<()>;
    fn list_active_downloads(&self) -> Result<Vec<LocalDownload>>;
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn parse_column<T>(row: &Row<'_>, index: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = LauncherError>,
{
    let raw: String = row.get(index)?;
    raw.parse::<T>()
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(err)))
}

const GAME_COLUMNS: &str =
    "id, url, title, install_path, installed_version, executable_path, installed, updated_at";

fn game_from_row(row: &Row<'_>) -> rusqlite::Result<LocalGame> {
    Ok(LocalGame {
        id: row.get(0)?,
        url: row.get(1)?,
        title: row.get(2)?,
        install_path: row.get(3)?,
        installed_version: row.get(4)?,
        executable_path: row.get(5)?,
        installed: row.get::<_, i64>(6)? != 0,
        updated_at: row.get(7)?,
    })
}

const DOWNLOAD_COLUMNS: &str = "id, game_id, transport, source_url, dest_path, install_path, info_hash,
     progress, status, speed, eta, size, error_message, created_at, updated_at";

fn download_from_row(row: &Row<'_>) -> rusqlite::Result<LocalDownload> {
    Ok(LocalDownload {
        id: row.get(0)?,
        game_id: row.get(1)?,
        transport: parse_column(row, 2)?,
        source_url: row.get(3)?,
        dest_path: row.get(4)?,
        install_path: row.get(5)?,
        info_hash: row.get(6)?,
        progress: row.get(7)?,
        status: parse_column(row, 8)?,
        speed: row.get(9)?,
        eta: row.get(10)?,
        size: row.get(11)?,
        error_message: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

impl SettingsQueries for Database {
    fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value, now()],
        )?;
        Ok(())
    }

    fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.connection()?;
        let value = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn delete_setting(&self, key: &str) -> Result<()> {
        let conn = self.connection()?;
        conn.execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(())
    }
}

impl GameQueries for Database {
    fn upsert_game(&self, game: &LocalGame) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO games (id, url, title, install_path, installed_version, executable_path, installed, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(url) DO UPDATE SET
                title = excluded.title,
                install_path = COALESCE(excluded.install_path, games.install_path),
                installed_version = COALESCE(excluded.installed_version, games.installed_version),
                executable_path = COALESCE(excluded.executable_path, games.executable_path),
                installed = MAX(excluded.installed, games.installed),
                updated_at = excluded.updated_at",
            params![
                game.id,
                game.url,
                game.title,
                game.install_path,
                game.installed_version,
                game.executable_path,
                game.installed as i64,
                now(),
            ],
        )?;
        Ok(())
    }

    fn get_game(&self, game_id: &str) -> Result<Option<LocalGame>> {
        let conn = self.connection()?;
        let game = conn
            .query_row(
                &format!("SELECT {GAME_COLUMNS} FROM games WHERE id = ?1"),
                params![game_id],
                game_from_row,
            )
            .optional()?;
        Ok(game)
    }

    fn get_game_by_url(&self, url: &str) -> Result<Option<LocalGame>> {
        let conn = self.connection()?;
        let game = conn
            .query_row(
                &format!("SELECT {GAME_COLUMNS} FROM games WHERE url = ?1"),
                params![url],
                game_from_row,
            )
            .optional()?;
        Ok(game)
    }

    fn mark_game_installed(
        &self,
        game_id: &str,
        version: Option<&str>,
        install_path: &str,
        executable_path: Option<&str>,
    ) -> Result<()> {
        let conn = self.connection()?;
        let changed = conn.execute(
            "UPDATE games SET installed = 1,
                installed_version = COALESCE(?2, installed_version),
                install_path = ?3,
                executable_path = COALESCE(?4, executable_path),
                updated_at = ?5
             WHERE id = ?1",
            params![game_id, version, install_path, executable_path, now()],
        )?;
        if changed == 0 {
            return Err(LauncherError::NotFound(format!("game {}", game_id)));
        }
        Ok(())
    }
}

impl DownloadQueries for Database {
    fn create_download(&self, download: &LocalDownload) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO downloads (
                id, game_id, transport, source_url, dest_path, install_path, info_hash,
                progress, status, speed, eta, size, error_message, created_at, updated_at
             )
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                download.id,
                download.game_id,
                download.transport.as_str(),
                download.source_url,
                download.dest_path,
                download.install_path,
                download.info_hash,
                download.progress,
                download.status.as_str(),
                download.speed,
                download.eta,
                download.size,
                download.error_message,
                download.created_at,
                download.updated_at,
            ],
        )?;
        Ok(())
    }

    fn get_download(&self, download_id: &str) -> Result<Option<LocalDownload>> {
        let conn = self.connection()?;
        let row = conn
            .query_row(
                &format!("SELECT {DOWNLOAD_COLUMNS} FROM downloads WHERE id = ?1"),
                params![download_id],
                download_from_row,
            )
            .optional()?;
        Ok(row)
    }

    fn get_download_by_source(&self, source_url: &str) -> Result<Option<LocalDownload>> {
        let conn = self.connection()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {DOWNLOAD_COLUMNS} FROM downloads WHERE source_url = ?1
                     ORDER BY updated_at DESC LIMIT 1"
                ),
                params![source_url],
                download_from_row,
            )
            .optional()?;
        Ok(row)
    }

    fn get_download_by_info_hash(&self, info_hash: &str) -> Result<Option<LocalDownload>> {
        let conn = self.connection()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {DOWNLOAD_COLUMNS} FROM downloads WHERE lower(info_hash) = lower(?1)
                     ORDER BY updated_at DESC LIMIT 1"
                ),
                params![info_hash],
                download_from_row,
            )
            .optional()?;
        Ok(row)
    }

    fn update_download_progress(
        &self,
        download_id: &str,
        update: &DownloadProgressUpdate,
    ) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "UPDATE downloads SET progress = ?2,
                speed = COALESCE(?3, speed),
                eta = COALESCE(?4, eta),
                size = COALESCE(?5, size),
                updated_at = ?6
             WHERE id = ?1",
            params![
                download_id,
                update.progress.clamp(0.0, 100.0),
                update.speed,
                update.eta,
                update.size,
                now(),
            ],
        )?;
        Ok(())
    }

    fn update_download_status(
        &self,
        download_id: &str,
        status: DownloadStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let conn = self.connection()?;
        let clears_rate = !matches!(status, DownloadStatus::Downloading);
        conn.execute(
            "UPDATE downloads SET status = ?2,
                error_message = ?3,
                speed = CASE WHEN ?4 THEN '' ELSE speed END,
                eta = CASE WHEN ?4 THEN '' ELSE eta END,
                updated_at = ?5
             WHERE id = ?1",
            params![download_id, status.as_str(), error_message, clears_rate, now()],
        )?;
        Ok(())
    }

    fn set_download_info_hash(&self, download_id: &str, info_hash: &str) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "UPDATE downloads SET info_hash = ?2, updated_at = ?3 WHERE id = ?1",
            params![download_id, info_hash, now()],
        )?;
        Ok(())
    }

    fn remove_download(&self, download_id: &str) -> Result<()> {
        let conn = self.connection()?;
        conn.execute("DELETE FROM downloads WHERE id = ?1", params![download_id])?;
        Ok(())
    }

    fn list_active_downloads(&self) -> Result<Vec<LocalDownload>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {DOWNLOAD_COLUMNS} FROM downloads
             WHERE status IN ('pending', 'downloading', 'paused', 'extracting')
             ORDER BY created_at ASC"
        ))?;
        let rows = stmt.query_map([], download_from_row)?;

        let mut downloads = Vec::new();
        for item in rows {
            downloads.push(item?);
        }
        Ok(downloads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TransportKind;

    fn sample_game(db: &Database) -> LocalGame {
        let game = LocalGame {
            id: "game-1".to_string(),
            url: "https://games.example/1".to_string(),
            title: "Sample".to_string(),
            install_path: None,
            installed_version: None,
            executable_path: None,
            installed: false,
            updated_at: 0,
        };
        db.upsert_game(&game).expect("upsert game");
        game
    }

    fn sample_download(id: &str) -> LocalDownload {
        LocalDownload {
            id: id.to_string(),
            game_id: "game-1".to_string(),
            transport: TransportKind::Torrent,
            source_url: "magnet:?xt=urn:btih:ABC".to_string(),
            dest_path: "/tmp/dl".to_string(),
            install_path: None,
            info_hash: None,
            progress: 0.0,
            status: DownloadStatus::Pending,
            speed: String::new(),
            eta: String::new(),
            size: String::new(),
            error_message: None,
            created_at: 1,
            updated_at: 1,
        }
    }

    #[test]
    fn download_rows_round_trip_status_and_hash() {
        let db = Database::open_in_memory().expect("db");
        db.create_download(&sample_download("d1")).expect("create");

        db.update_download_status("d1", DownloadStatus::Downloading, None)
            .expect("status");
        db.set_download_info_hash("d1", "abcdef").expect("hash");
        db.update_download_progress(
            "d1",
            &DownloadProgressUpdate {
                progress: 140.0,
                speed: Some("1 MB/s".to_string()),
                ..Default::default()
            },
        )
        .expect("progress");

        let row = db.get_download_by_info_hash("ABCDEF").expect("query").expect("row");
        assert_eq!(row.status, DownloadStatus::Downloading);
        assert_eq!(row.progress, 100.0);
        assert_eq!(row.speed, "1 MB/s");

        db.update_download_status("d1", DownloadStatus::Error, Some("boom"))
            .expect("status");
        let row = db.get_download("d1").expect("query").expect("row");
        assert_eq!(row.error_message.as_deref(), Some("boom"));
        assert!(row.speed.is_empty());
    }

    #[test]
    fn active_downloads_exclude_terminal_rows() {
        let db = Database::open_in_memory().expect("db");
        db.create_download(&sample_download("a")).expect("create");
        db.create_download(&sample_download("b")).expect("create");
        db.update_download_status("b", DownloadStatus::Cancelled, None)
            .expect("status");

        let active = db.list_active_downloads().expect("list");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "a");
    }

    #[test]
    fn marking_installed_keeps_url_identity() {
        let db = Database::open_in_memory().expect("db");
        let game = sample_game(&db);
        db.mark_game_installed(&game.id, Some("1.2"), "/games/sample", Some("/games/sample/game.exe"))
            .expect("mark");

        let stored = db.get_game_by_url(&game.url).expect("query").expect("game");
        assert!(stored.installed);
        assert_eq!(stored.installed_version.as_deref(), Some("1.2"));
        assert_eq!(stored.executable_path.as_deref(), Some("/games/sample/game.exe"));

        assert!(db.mark_game_installed("missing", None, "/x", None).is_err());
    }
}
