use crate::class_loader::ArchiveReader;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use walkdir::WalkDir;

pub enum ClassPathEntry {
    Directory(DirIndex),
    Archive(Box<dyn ArchiveReader>),
    Memory(String, Vec<u8>),
}

impl ClassPathEntry {
    pub fn load(&self, name: &str) -> Option<Vec<u8>> {
        match self {
            ClassPathEntry::Directory(index) => index.load(name),
            ClassPathEntry::Archive(reader) => reader.read_entry(&format!("{}.class", name)),
            ClassPathEntry::Memory(entry_name, bytes) => {
                (entry_name == name).then(|| bytes.clone())
            }
        }
    }
}

/// A directory on the classpath, indexed once on first use: internal class
/// name to file path for every `.class` file underneath it.
pub struct DirIndex {
    root: PathBuf,
    index: Mutex<Option<HashMap<String, PathBuf>>>,
}

impl DirIndex {
    pub fn new(root: PathBuf) -> Self {
        DirIndex {
            root,
            index: Mutex::new(None),
        }
    }

    fn load(&self, name: &str) -> Option<Vec<u8>> {
        let mut index = self.index.lock().unwrap();
        let map = index.get_or_insert_with(|| Self::build(&self.root));
        let path = map.get(name)?;
        std::fs::read(path).ok()
    }

    fn build(root: &PathBuf) -> HashMap<String, PathBuf> {
        let mut map = HashMap::new();
        for entry in WalkDir::new(root).into_iter().flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "class") {
                if let Ok(rel) = path.strip_prefix(root) {
                    let mut name = rel.to_string_lossy().replace('\\', "/");
                    name.truncate(name.len() - ".class".len());
                    map.insert(name, path.to_path_buf());
                }
            }
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class_loader::ClassPath;

    #[test]
    fn memory_entries_resolve_by_exact_name() {
        let mut cp = ClassPath::new();
        cp.push_memory("com/example/Foo", vec![1, 2, 3]);
        assert_eq!(cp.load("com/example/Foo"), Some(vec![1, 2, 3]));
        assert_eq!(cp.load("com/example/Bar"), None);
    }

    #[test]
    fn directory_index_finds_nested_classes() {
        let dir = std::env::temp_dir().join(format!("valka-cp-test-{}", std::process::id()));
        let nested = dir.join("a/b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("C.class"), [0xCA, 0xFE]).unwrap();

        let mut cp = ClassPath::new();
        cp.push_directory(dir.clone());
        assert_eq!(cp.load("a/b/C"), Some(vec![0xCA, 0xFE]));
        assert_eq!(cp.load("a/b/D"), None);

        std::fs::remove_dir_all(dir).ok();
    }
}
