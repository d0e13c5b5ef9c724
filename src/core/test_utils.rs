//! Test utilities for layer builds.
//!
//! Every layer build in a test runs inside a scratch directory that is
//! removed when the test context is dropped.

#[cfg(test)]
pub mod test {
    use std::fs;
    use std::path::{Path, PathBuf};

    use object::write::Object;
    use object::{Architecture, BinaryFormat, Endianness};
    use tempfile::TempDir;

    use super::super::config::BuildConfig;
    use super::super::session::BuildSession;
    use crate::archive::writer::LayerArchiveWriter;

    /// Platform every test archive is written for.
    pub const TEST_PLATFORM: &str = "linux-x86_64";

    /// Test context that owns a scratch directory for archives and
    /// artifacts.
    pub struct TestContext {
        dir: TempDir,
    }

    impl TestContext {
        pub fn new() -> Self {
            Self {
                dir: TempDir::new().expect("create scratch directory"),
            }
        }

        pub fn path(&self) -> &Path {
            self.dir.path()
        }

        /// Configuration matching [`TEST_PLATFORM`].
        pub fn config(&self) -> BuildConfig {
            BuildConfig {
                platform: TEST_PLATFORM.into(),
                ..BuildConfig::default()
            }
        }

        /// Archive writer targeting the scratch directory.
        pub fn writer(&self) -> LayerArchiveWriter {
            LayerArchiveWriter::new(self.path(), TEST_PLATFORM)
        }

        /// Write a stand-in compiled artifact named `name`.
        pub fn artifact(&self, name: &str) -> PathBuf {
            let path = self.path().join(name);
            fs::write(&path, b"\x7fELF layer artifact").expect("write artifact");
            path
        }

        /// Empty relocatable object for the layer's symbols.
        pub fn object(&self) -> Object<'static> {
            Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little)
        }

        pub fn initial_session(&self, name: &str) -> BuildSession {
            BuildSession::initial(name, self.config()).expect("initial session")
        }

        /// Run `f` with a fresh initial-layer session.
        pub fn with_session<F, R>(&self, name: &str, f: F) -> R
        where
            F: FnOnce(&BuildSession) -> R,
        {
            let session = self.initial_session(name);
            f(&session)
        }
    }

    impl Default for TestContext {
        fn default() -> Self {
            Self::new()
        }
    }
}
