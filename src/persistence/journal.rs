use crate::entities::creature::{CharacterId, EntityId, MapKey, TemplateId};
use crate::telemetry::logging;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillRecord {
    pub killer: Option<CharacterId>,
    pub entity: EntityId,
    pub template: TemplateId,
    pub map: MapKey,
    pub experience: u32,
    pub drops: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LootRecord {
    pub looter: CharacterId,
    pub drop: EntityId,
    pub item: u32,
    pub count: u16,
    pub map: MapKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PvpKill {
    pub killer: CharacterId,
    pub victim: CharacterId,
    pub map: MapKey,
}

/// Persistence hooks. Called only at death and loot boundaries, never from
/// the hot movement path.
pub trait WorldJournal: Send + Sync {
    fn record_kill(&self, record: &KillRecord);
    fn record_loot(&self, record: &LootRecord);
    fn record_pvp(&self, record: &PvpKill);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullJournal;

impl WorldJournal for NullJournal {
    fn record_kill(&self, _record: &KillRecord) {}
    fn record_loot(&self, _record: &LootRecord) {}
    fn record_pvp(&self, _record: &PvpKill) {}
}

/// Append-only text journal under `<root>/save/journal.log`.
#[derive(Debug)]
pub struct FileJournal {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileJournal {
    pub fn open(root: &Path) -> Result<Self, String> {
        let dir = root.join("save");
        std::fs::create_dir_all(&dir)
            .map_err(|err| format!("failed to create {}: {}", dir.display(), err))?;
        let path = dir.join("journal.log");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| format!("failed to open {}: {}", path.display(), err))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, line: String) {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        let result = writeln!(file, "{} {}", logging::unix_timestamp(), line)
            .and_then(|_| file.flush());
        if let Err(err) = result {
            logging::log_error(&format!("journal write to {} failed: {}", self.path.display(), err));
        }
    }
}

fn killer_label(killer: Option<CharacterId>) -> String {
    killer
        .map(|id| id.0.to_string())
        .unwrap_or_else(|| "-".to_string())
}

impl WorldJournal for FileJournal {
    fn record_kill(&self, record: &KillRecord) {
        self.append(format!(
            "kill map={} entity={} template={} killer={} exp={} drops={}",
            record.map,
            record.entity.0,
            record.template.0,
            killer_label(record.killer),
            record.experience,
            record.drops
        ));
    }

    fn record_loot(&self, record: &LootRecord) {
        self.append(format!(
            "loot map={} drop={} looter={} item={} count={}",
            record.map, record.drop.0, record.looter.0, record.item, record.count
        ));
    }

    fn record_pvp(&self, record: &PvpKill) {
        self.append(format!(
            "pvp map={} killer={} victim={}",
            record.map, record.killer.0, record.victim.0
        ));
    }
}

/// Keeps records in memory; handy for embedders that persist in batches.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    kills: Mutex<Vec<KillRecord>>,
    loots: Mutex<Vec<LootRecord>>,
    pvp: Mutex<Vec<PvpKill>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kills(&self) -> Vec<KillRecord> {
        self.kills.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn loots(&self) -> Vec<LootRecord> {
        self.loots.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn pvp(&self) -> Vec<PvpKill> {
        self.pvp.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl WorldJournal for MemoryJournal {
    fn record_kill(&self, record: &KillRecord) {
        self.kills
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
    }

    fn record_loot(&self, record: &LootRecord) {
        self.loots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
    }

    fn record_pvp(&self, record: &PvpKill) {
        self.pvp
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_root(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "overworld-journal-{}-{}",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn file_journal_appends_lines() {
        let root = scratch_root("append");
        let journal = FileJournal::open(&root).expect("journal");
        journal.record_kill(&KillRecord {
            killer: Some(CharacterId(4)),
            entity: EntityId(9),
            template: TemplateId(1),
            map: MapKey::new(1, 2),
            experience: 50,
            drops: 2,
        });
        journal.record_pvp(&PvpKill {
            killer: CharacterId(4),
            victim: CharacterId(5),
            map: MapKey::new(1, 2),
        });
        let content = std::fs::read_to_string(journal.path()).expect("read");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("kill map=1:2 entity=9 template=1 killer=4 exp=50 drops=2"));
        assert!(lines[1].ends_with("pvp map=1:2 killer=4 victim=5"));
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn memory_journal_collects() {
        let journal = MemoryJournal::new();
        journal.record_loot(&LootRecord {
            looter: CharacterId(1),
            drop: EntityId(2),
            item: 3,
            count: 4,
            map: MapKey::new(1, 1),
        });
        assert_eq!(journal.loots().len(), 1);
        assert!(journal.kills().is_empty());
    }
}
