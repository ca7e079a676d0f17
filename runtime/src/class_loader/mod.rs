use crate::debug_log;
use crate::class_loader::class_path::{ClassPathEntry, DirIndex};
use std::path::PathBuf;

pub mod class_path;

/// The seam through which JAR/ZIP archives are opened. Decompression is an
/// external collaborator; the core only consumes entry bytes by name.
pub trait ArchiveReader: Send + Sync {
    fn read_entry(&self, name: &str) -> Option<Vec<u8>>;
}

/// Bootstrap classpath: an ordered list of sources searched for `.class`
/// bytes. Names beginning with the boot prefixes are looked up on the boot
/// path first; everything else walks the user path.
pub struct ClassPath {
    boot_entries: Vec<ClassPathEntry>,
    entries: Vec<ClassPathEntry>,
}

const BOOT_PREFIXES: [&str; 3] = ["java/", "javax/", "valka/"];

impl ClassPath {
    pub fn new() -> Self {
        ClassPath {
            boot_entries: Vec::new(),
            entries: Vec::new(),
        }
    }

    /// Parses a colon-separated path; `.jar` suffixes would name archive
    /// entries, which need a reader supplied through `push_archive`.
    pub fn from_search_path(path: &str) -> Self {
        let mut cp = ClassPath::new();
        for part in path.split(':').filter(|p| !p.is_empty()) {
            if part.ends_with(".jar") {
                debug_log!("archive classpath entry {} needs an archive reader", part);
            } else {
                cp.push_directory(PathBuf::from(part));
            }
        }
        cp
    }

    pub fn push_directory(&mut self, dir: PathBuf) {
        self.entries.push(ClassPathEntry::Directory(DirIndex::new(dir)));
    }

    pub fn push_boot_directory(&mut self, dir: PathBuf) {
        self.boot_entries
            .push(ClassPathEntry::Directory(DirIndex::new(dir)));
    }

    pub fn push_archive(&mut self, reader: Box<dyn ArchiveReader>) {
        self.entries.push(ClassPathEntry::Archive(reader));
    }

    pub fn push_boot_archive(&mut self, reader: Box<dyn ArchiveReader>) {
        self.boot_entries.push(ClassPathEntry::Archive(reader));
    }

    /// Registers in-memory class bytes, used by embedders and tests.
    pub fn push_memory(&mut self, name: &str, bytes: Vec<u8>) {
        self.boot_entries
            .push(ClassPathEntry::Memory(name.to_string(), bytes));
    }

    /// Fetches the bytes of a class by its internal (slash-separated) name.
    #[hotpath::measure]
    pub fn load(&self, name: &str) -> Option<Vec<u8>> {
        let boot_first = BOOT_PREFIXES.iter().any(|p| name.starts_with(p));
        let (first, second): (&[ClassPathEntry], &[ClassPathEntry]) = if boot_first {
            (&self.boot_entries, &self.entries)
        } else {
            (&self.entries, &self.boot_entries)
        };

        for entry in first.iter().chain(second) {
            if let Some(bytes) = entry.load(name) {
                debug_log!("class {} found on the classpath", name);
                return Some(bytes);
            }
        }
        None
    }
}

impl Default for ClassPath {
    fn default() -> Self {
        Self::new()
    }
}
