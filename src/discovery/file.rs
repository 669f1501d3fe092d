use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{Discoverer, TargetGroup};
use crate::config::duration;

fn default_refresh_interval() -> Duration {
    Duration::from_secs(30)
}

/// File-based discovery: a list of YAML files holding target groups,
/// re-read on an interval.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FileSdConfig {
    /// Files to read target groups from.
    pub files: Vec<PathBuf>,

    #[serde(default = "default_refresh_interval", with = "duration")]
    pub refresh_interval: Duration,
}

pub struct FileProvider {
    config: FileSdConfig,
}

impl FileProvider {
    pub fn new(config: FileSdConfig) -> Self {
        Self { config }
    }

    async fn refresh(&self) -> Vec<TargetGroup> {
        let mut groups = vec![];

        for path in &self.config.files {
            match read_groups(path).await {
                Ok(read) => groups.extend(read),
                Err(err) => {
                    warn!(
                        message = "reading file discovery targets failed",
                        path = %path.display(),
                        %err,
                    );
                }
            }
        }

        groups
    }
}

async fn read_groups(path: &Path) -> crate::Result<Vec<TargetGroup>> {
    let content = tokio::fs::read_to_string(path).await?;
    let mut groups: Vec<TargetGroup> = serde_yaml::from_str(&content)?;

    for (i, group) in groups.iter_mut().enumerate() {
        group.source = format!("{}:{}", path.display(), i);
    }

    Ok(groups)
}

#[async_trait]
impl Discoverer for FileProvider {
    async fn run(self: Box<Self>, ctx: CancellationToken, out: mpsc::Sender<Vec<TargetGroup>>) {
        let mut ticker = tokio::time::interval(self.config.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // The first tick fires immediately, which doubles as the
            // initial emit.
            tokio::select! {
                _ = ticker.tick() => {}
                _ = ctx.cancelled() => return,
            }

            let groups = self.refresh().await;
            if out.send(groups).await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::labels::ADDRESS_LABEL;

    fn provider(file: &tempfile::NamedTempFile) -> Box<FileProvider> {
        Box::new(FileProvider::new(FileSdConfig {
            files: vec![file.path().to_path_buf()],
            refresh_interval: Duration::from_secs(30),
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn emits_groups_and_refreshes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "- targets: [\"a:80\"]").unwrap();
        file.flush().unwrap();

        let (tx, mut rx) = mpsc::channel(1);
        let ctx = CancellationToken::new();
        tokio::spawn(provider(&file).run(ctx.clone(), tx));

        let initial = rx.recv().await.unwrap();
        assert_eq!(initial.len(), 1);
        assert_eq!(initial[0].targets[0].get(ADDRESS_LABEL), Some("a:80"));
        assert!(initial[0].source.ends_with(":0"));

        writeln!(file, "- targets: [\"b:80\"]").unwrap();
        file.flush().unwrap();

        // a refresh of the old content may still be in flight
        let mut refreshed = rx.recv().await.unwrap();
        for _ in 0..10 {
            if refreshed.len() == 2 {
                break;
            }
            refreshed = rx.recv().await.unwrap();
        }
        assert_eq!(refreshed.len(), 2);

        ctx.cancel();
        while rx.recv().await.is_some() {}
    }

    #[tokio::test(start_paused = true)]
    async fn unreadable_file_yields_empty_set() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let boxed = provider(&file);
        drop(file); // removed before the first read

        let (tx, mut rx) = mpsc::channel(1);
        tokio::spawn(boxed.run(CancellationToken::new(), tx));

        assert!(rx.recv().await.unwrap().is_empty());
    }
}
