use std::ops::{Deref, DerefMut};
use std::path::PathBuf;

use tempfile::TempDir;

use crate::db::{BlockFs, Options};

pub(crate) struct TestFs {
    pub(crate) dir: TempDir,
    pub(crate) fs: Option<BlockFs>,
    options: Options,
}

impl Deref for TestFs {
    type Target = BlockFs;

    fn deref(&self) -> &Self::Target {
        self.fs.as_ref().unwrap()
    }
}

impl DerefMut for TestFs {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.fs.as_mut().unwrap()
    }
}

impl TestFs {
    pub(crate) fn new() -> crate::Result<Self> {
        Self::with_options(Options::default())
    }

    pub(crate) fn with_options(options: Options) -> crate::Result<Self> {
        let _ = env_logger::builder().is_test(true).try_init();

        let dir = TempDir::new()?;
        let fs = BlockFs::mount_with(dir.path().join("store.mnt"), options.clone())?;

        Ok(Self {
            dir,
            fs: Some(fs),
            options,
        })
    }

    pub(crate) fn mount_file(&self) -> PathBuf {
        self.dir.path().join("store.mnt")
    }

    /// Closes and mounts the filesystem again, driving the recovery scan
    /// over whatever the previous instance left on disk.
    pub(crate) fn remount(&mut self) -> crate::Result<()> {
        if let Some(fs) = self.fs.take() {
            fs.close(false)?;
        }
        self.fs = Some(BlockFs::mount_with(self.mount_file(), self.options.clone())?);
        Ok(())
    }
}
