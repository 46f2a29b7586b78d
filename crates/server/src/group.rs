use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use palaver_protocol::{AdmissionError, GroupDescription, GroupStatus, valid_group_name};
use webrtc::api::API;

use crate::client::Client;

/// How long a loaded description is trusted before the file is stat'd
/// again.
const DESCRIPTION_TTL: Duration = Duration::from_secs(5);

/// One chat message kept for replay to late joiners.
#[derive(Debug, Clone)]
pub struct ChatEntry {
    pub source: String,
    pub username: Option<String>,
    pub kind: String,
    pub time: DateTime<Utc>,
    pub value: String,
}

struct GroupState {
    description: Arc<GroupDescription>,
    desc_checked: Instant,
    desc_modified: Option<SystemTime>,
    dead: bool,
    /// Manual lock set by an operator, with an optional message.
    /// The description's own `locked` flag is OR'ed in.
    locked: Option<String>,
    clients: HashMap<String, Arc<Client>>,
    chat: VecDeque<ChatEntry>,
    /// Operator-settable metadata, merged by `groupaction setdata`.
    data: serde_json::Map<String, serde_json::Value>,
}

/// A named room: the place where publishers, subscribers, permissions
/// and chat meet. All mutable state sits behind one mutex; the
/// video-publisher count is read on every allocator tick and stays
/// atomic.
pub struct Group {
    name: String,
    api: Arc<API>,
    chat_limit: usize,
    video_publishers: AtomicU32,
    state: parking_lot::Mutex<GroupState>,
}

impl Group {
    fn new(name: String, api: Arc<API>, chat_limit: usize, description: GroupDescription) -> Self {
        Group {
            name,
            api,
            chat_limit,
            video_publishers: AtomicU32::new(0),
            state: parking_lot::Mutex::new(GroupState {
                description: Arc::new(description),
                desc_checked: Instant::now(),
                desc_modified: None,
                dead: false,
                locked: None,
                clients: HashMap::new(),
                chat: VecDeque::new(),
                data: serde_json::Map::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn api(&self) -> &Arc<API> {
        &self.api
    }

    pub fn description(&self) -> Arc<GroupDescription> {
        self.state.lock().description.clone()
    }

    pub fn dead(&self) -> bool {
        self.state.lock().dead
    }

    pub fn set_locked(&self, message: Option<String>) {
        self.state.lock().locked = message;
    }

    pub fn unlock(&self) {
        self.state.lock().locked = None;
    }

    /// Admit a client whose credentials have already been verified
    /// against the description. Enforces the lock, the client cap and
    /// id uniqueness; the caller fans out the `user` notifications.
    pub fn add_client(
        &self,
        client: Arc<Client>,
        op: bool,
    ) -> Result<(), AdmissionError> {
        let mut state = self.state.lock();
        if state.dead {
            return Err(AdmissionError::UnknownGroup);
        }
        if (state.locked.is_some() || state.description.locked) && !op {
            return Err(AdmissionError::GroupLocked);
        }
        let max = state.description.max_clients;
        if max > 0 && state.clients.len() >= max && !op {
            return Err(AdmissionError::GroupFull);
        }
        if state.clients.contains_key(&client.id) {
            return Err(AdmissionError::DuplicateId);
        }
        state.clients.insert(client.id.clone(), client);
        Ok(())
    }

    pub fn del_client(&self, id: &str) -> Option<Arc<Client>> {
        self.state.lock().clients.remove(id)
    }

    pub fn get_client(&self, id: &str) -> Option<Arc<Client>> {
        self.state.lock().clients.get(id).cloned()
    }

    pub fn members(&self) -> Vec<Arc<Client>> {
        self.state.lock().clients.values().cloned().collect()
    }

    pub fn client_count(&self) -> usize {
        self.state.lock().clients.len()
    }

    pub fn add_chat(&self, entry: ChatEntry) {
        let mut state = self.state.lock();
        while state.chat.len() >= self.chat_limit {
            state.chat.pop_front();
        }
        state.chat.push_back(entry);
    }

    pub fn chat_history(&self) -> Vec<ChatEntry> {
        self.state.lock().chat.iter().cloned().collect()
    }

    pub fn clear_chat_history(&self) {
        self.state.lock().chat.clear();
    }

    pub fn merge_data(&self, value: &serde_json::Value) {
        if let Some(map) = value.as_object() {
            let mut state = self.state.lock();
            for (k, v) in map {
                state.data.insert(k.clone(), v.clone());
            }
        }
    }

    pub fn data(&self) -> serde_json::Map<String, serde_json::Value> {
        self.state.lock().data.clone()
    }

    pub fn add_video_publisher(&self) -> u32 {
        self.video_publishers.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn del_video_publisher(&self) -> u32 {
        // saturating decrement; teardown paths may race with each other
        let mut current = self.video_publishers.load(Ordering::Relaxed);
        while current > 0 {
            match self.video_publishers.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return current - 1,
                Err(v) => current = v,
            }
        }
        0
    }

    pub fn video_publisher_count(&self) -> u32 {
        self.video_publishers.load(Ordering::Relaxed)
    }

    /// Re-stat the description file at most every 5 s. A vanished file
    /// turns the group into a zombie: existing clients continue, new
    /// joins fail.
    fn refresh_description(&self, path: &Path) {
        let mut state = self.state.lock();
        if state.desc_checked.elapsed() < DESCRIPTION_TTL {
            return;
        }
        state.desc_checked = Instant::now();

        let modified = match std::fs::metadata(path) {
            Ok(meta) => meta.modified().ok(),
            Err(_) => {
                if !state.dead {
                    tracing::warn!(group = %self.name, "Description file gone, group is now a zombie");
                }
                state.dead = true;
                return;
            }
        };

        state.dead = false;
        if modified == state.desc_modified && state.desc_modified.is_some() {
            return;
        }

        match load_description(path) {
            Ok(desc) => {
                tracing::info!(group = %self.name, "Reloaded group description");
                state.description = Arc::new(desc);
                state.desc_modified = modified;
            }
            Err(e) => {
                tracing::warn!(group = %self.name, "Failed to reload description: {e}");
            }
        }
    }

    pub fn status(&self, base_url: &str, with_private: bool) -> GroupStatus {
        let state = self.state.lock();
        let desc = &state.description;
        let mut status = GroupStatus {
            name: self.name.clone(),
            location: base_url.to_owned(),
            endpoint: format!("{}/ws", base_url.replacen("http", "ws", 1)),
            display_name: desc.display_name.clone(),
            description: desc.description.clone(),
            auth_server: desc.auth_server.clone(),
            auth_portal: desc.auth_portal.clone(),
            locked: None,
            client_count: None,
        };
        if with_private {
            status.locked = Some(state.locked.is_some() || desc.locked);
            status.client_count = Some(state.clients.len());
        }
        status
    }
}

/// Thread-safe registry of groups, lazily populated from the
/// description directory.
pub struct Groups {
    api: Arc<API>,
    dir: PathBuf,
    chat_limit: usize,
    groups: parking_lot::Mutex<HashMap<String, Arc<Group>>>,
}

impl Groups {
    pub fn new(api: Arc<API>, dir: impl Into<PathBuf>, chat_limit: usize) -> Self {
        Groups {
            api,
            dir: dir.into(),
            chat_limit,
            groups: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    fn description_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    /// Look up a group, creating it from its on-disk description (or
    /// the supplied one) on first use. Loaded descriptions are
    /// refreshed with stat-based change detection.
    pub fn add(
        &self,
        name: &str,
        description: Option<GroupDescription>,
    ) -> Result<Arc<Group>, AdmissionError> {
        if !valid_group_name(name) {
            return Err(AdmissionError::UnknownGroup);
        }

        let path = self.description_path(name);
        let mut groups = self.groups.lock();
        if let Some(group) = groups.get(name) {
            let group = group.clone();
            drop(groups);
            group.refresh_description(&path);
            return Ok(group);
        }

        let desc = match description {
            Some(d) => {
                d.check_sets()?;
                d
            }
            None => load_description(&path)?,
        };
        let group = Arc::new(Group::new(
            name.to_owned(),
            self.api.clone(),
            self.chat_limit,
            desc,
        ));
        groups.insert(name.to_owned(), group.clone());
        tracing::info!(group = %name, "Group created");
        Ok(group)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Group>> {
        self.groups.lock().get(name).cloned()
    }

    pub fn range(&self, mut f: impl FnMut(&Arc<Group>)) {
        let snapshot: Vec<_> = self.groups.lock().values().cloned().collect();
        for group in &snapshot {
            f(group);
        }
    }

    /// Drop zombie groups that have no clients left.
    pub fn cleanup(&self) {
        let mut groups = self.groups.lock();
        groups.retain(|name, group| {
            let keep = !group.dead() || group.client_count() > 0;
            if !keep {
                tracing::info!(group = %name, "Removing dead empty group");
            }
            keep
        });
    }

    /// Statuses of all public groups found on disk, for
    /// `/public-groups.json`.
    pub fn public_statuses(&self, base_url: &str) -> Vec<GroupStatus> {
        let mut statuses = Vec::new();
        let mut names = Vec::new();
        collect_group_names(&self.dir, "", &mut names);
        names.sort();
        for name in names {
            let Ok(desc) = load_description(&self.description_path(&name)) else {
                continue;
            };
            if !desc.public {
                continue;
            }
            match self.add(&name, None) {
                Ok(group) => statuses.push(group.status(base_url, true)),
                Err(_) => continue,
            }
        }
        statuses
    }

    /// Status of a single group, for `{group-URL}.status`. Does not
    /// leak the client count or lock state of non-public groups.
    pub fn status_of(&self, name: &str, base_url: &str) -> Option<GroupStatus> {
        if !valid_group_name(name) {
            return None;
        }
        let desc = load_description(&self.description_path(name)).ok()?;
        let public = desc.public;
        let group = self.add(name, Some(desc)).ok()?;
        Some(group.status(base_url, public))
    }
}

fn load_description(path: &Path) -> Result<GroupDescription, AdmissionError> {
    let data = std::fs::read_to_string(path).map_err(|_| AdmissionError::UnknownGroup)?;
    let desc: GroupDescription = match serde_json::from_str(&data) {
        Ok(desc) => desc,
        Err(e) => {
            tracing::warn!(path = %path.display(), "Bad group description: {e}");
            return Err(AdmissionError::UnknownGroup);
        }
    };
    desc.check_sets()?;
    Ok(desc)
}

fn collect_group_names(dir: &Path, prefix: &str, out: &mut Vec<String>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if path.is_dir() {
            let nested = if prefix.is_empty() {
                stem.to_owned()
            } else {
                format!("{prefix}/{stem}")
            };
            collect_group_names(&path, &nested, out);
        } else if path.extension().and_then(|e| e.to_str()) == Some("json") {
            if prefix.is_empty() {
                out.push(stem.to_owned());
            } else {
                out.push(format!("{prefix}/{stem}"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;

    fn test_dir(tag: &str) -> PathBuf {
        static SEQ: AtomicU32 = AtomicU32::new(0);
        let dir = std::env::temp_dir().join(format!(
            "palaver-test-{}-{}-{}",
            tag,
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_description(dir: &Path, name: &str, json: &str) {
        let path = dir.join(format!("{name}.json"));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, json).unwrap();
    }

    fn registry(dir: &Path) -> Groups {
        let api = Arc::new(crate::engine::build_api().unwrap());
        Groups::new(api, dir, 20)
    }

    const OPEN_GROUP: &str = r#"{
        "public": true,
        "allow-anonymous": true,
        "max-clients": 2,
        "op": [{"username": "admin", "password": "pw"}],
        "presenter": [{}]
    }"#;

    #[tokio::test]
    async fn add_loads_description_from_disk() {
        let dir = test_dir("load");
        write_description(&dir, "lobby", OPEN_GROUP);
        let groups = registry(&dir);
        let group = groups.add("lobby", None).unwrap();
        assert_eq!(group.description().max_clients, 2);
        assert!(groups.add("missing", None).is_err());
        assert!(groups.add("../lobby", None).is_err());
    }

    #[tokio::test]
    async fn unknown_permission_set_fails_admission() {
        let dir = test_dir("unknown-set");
        write_description(
            &dir,
            "typo",
            r#"{
                "allow-anonymous": true,
                "moderators": [{"username": "admin", "password": "pw"}]
            }"#,
        );
        let groups = registry(&dir);
        assert_eq!(
            groups.add("typo", None).err(),
            Some(AdmissionError::UnknownPermissionSet)
        );
    }

    #[tokio::test]
    async fn admission_enforces_capacity_and_duplicates() {
        let dir = test_dir("admission");
        write_description(&dir, "room", OPEN_GROUP);
        let groups = registry(&dir);
        let group = groups.add("room", None).unwrap();

        let (a, _ha) = Client::for_tests("a");
        let (b, _hb) = Client::for_tests("b");
        let (c, _hc) = Client::for_tests("c");

        group.add_client(a.clone(), false).unwrap();
        assert_eq!(
            group.add_client(a.clone(), false),
            Err(AdmissionError::DuplicateId)
        );
        group.add_client(b, false).unwrap();
        assert_eq!(
            group.add_client(c.clone(), false),
            Err(AdmissionError::GroupFull)
        );
        // operators bypass the cap
        group.add_client(c, true).unwrap();
        assert_eq!(group.client_count(), 3);
    }

    #[tokio::test]
    async fn locked_group_admits_only_ops() {
        let dir = test_dir("locked");
        write_description(&dir, "room", OPEN_GROUP);
        let groups = registry(&dir);
        let group = groups.add("room", None).unwrap();
        group.set_locked(Some("maintenance".to_owned()));

        let (a, _ha) = Client::for_tests("a");
        let (b, _hb) = Client::for_tests("b");
        assert_eq!(
            group.add_client(a, false),
            Err(AdmissionError::GroupLocked)
        );
        group.add_client(b, true).unwrap();

        group.unlock();
        let (c, _hc) = Client::for_tests("c");
        group.add_client(c, false).unwrap();
    }

    #[tokio::test]
    async fn deleted_description_makes_zombie() {
        let dir = test_dir("zombie");
        write_description(&dir, "room", OPEN_GROUP);
        let groups = registry(&dir);
        let group = groups.add("room", None).unwrap();
        let (a, _ha) = Client::for_tests("a");
        group.add_client(a, false).unwrap();

        std::fs::remove_file(dir.join("room.json")).unwrap();
        // force the stat past the 5 s TTL
        group.state.lock().desc_checked = Instant::now() - Duration::from_secs(6);
        let group = groups.add("room", None).unwrap();
        assert!(group.dead());

        let (b, _hb) = Client::for_tests("b");
        assert_eq!(
            group.add_client(b, false),
            Err(AdmissionError::UnknownGroup)
        );
        // the existing client is still there
        assert_eq!(group.client_count(), 1);

        group.del_client("a");
        groups.cleanup();
        assert!(groups.get("room").is_none());
    }

    #[tokio::test]
    async fn chat_history_is_bounded() {
        let dir = test_dir("chat");
        write_description(&dir, "room", OPEN_GROUP);
        let groups = registry(&dir);
        let group = groups.add("room", None).unwrap();

        for i in 0..25 {
            group.add_chat(ChatEntry {
                source: "a".into(),
                username: Some("alice".into()),
                kind: String::new(),
                time: Utc::now(),
                value: format!("msg {i}"),
            });
        }
        let history = group.chat_history();
        assert_eq!(history.len(), 20);
        assert_eq!(history[0].value, "msg 5");
        group.clear_chat_history();
        assert!(group.chat_history().is_empty());
    }

    #[tokio::test]
    async fn video_publisher_count_saturates() {
        let dir = test_dir("pubs");
        write_description(&dir, "room", OPEN_GROUP);
        let groups = registry(&dir);
        let group = groups.add("room", None).unwrap();
        assert_eq!(group.add_video_publisher(), 1);
        assert_eq!(group.add_video_publisher(), 2);
        assert_eq!(group.del_video_publisher(), 1);
        assert_eq!(group.del_video_publisher(), 0);
        assert_eq!(group.del_video_publisher(), 0);
    }

    #[tokio::test]
    async fn public_statuses_list_only_public_groups() {
        let dir = test_dir("public");
        write_description(&dir, "open", OPEN_GROUP);
        write_description(&dir, "secret", r#"{"allow-anonymous": true}"#);
        write_description(&dir, "team/standup", OPEN_GROUP);
        let groups = registry(&dir);
        let statuses = groups.public_statuses("https://sfu.example.org");
        let names: Vec<_> = statuses.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["open", "team/standup"]);
        assert_eq!(statuses[0].client_count, Some(0));
        assert!(statuses[0].endpoint.starts_with("wss://"));
    }
}
