//! The engine facade: the single entry point embedders use to download a
//! torrent, wiring together metainfo parsing, the tracker client, the piece
//! manager and the coordinator.

use std::path::Path;

use crate::coordinator::Coordinator;
use crate::error::Error;
use crate::{Conf, TorrentDescriptor};

/// A download engine configured for a single client identity and set of
/// defaults. Create once, then call [`Engine::run`] once per torrent.
pub struct Engine {
    conf: Conf,
}

impl Engine {
    pub fn new(conf: Conf) -> Self {
        Self { conf }
    }

    /// Downloads the torrent described by the metainfo file at
    /// `torrent_path`, blocking (asynchronously) until every piece has been
    /// downloaded, verified and written to `conf.torrent.download_dir`.
    ///
    /// Returns once the download is complete, or on any engine-fatal error:
    /// a malformed metainfo file, or the tracker becoming unreachable for
    /// the full announce-retry budget.
    pub async fn run(&self, torrent_path: &Path) -> Result<(), Error> {
        let buf = tokio::fs::read(torrent_path)
            .await
            .map_err(crate::error::MetainfoError::Io)?;
        let descriptor = TorrentDescriptor::from_bytes(&buf)?;

        log::info!(
            "Starting download of {} pieces ({} bytes) to {}",
            descriptor.piece_count(),
            descriptor.total_size(),
            self.conf.torrent.download_dir.display(),
        );

        tokio::fs::create_dir_all(&self.conf.torrent.download_dir)
            .await
            .map_err(crate::error::DiskError::Io)?;

        let mut coordinator = Coordinator::new(descriptor, self.conf.clone());
        coordinator.run().await
    }
}
