/// Spec §3 `SharedFile`, minus the `origins` list (origins are resolved
/// separately via `IndexStore::find_sharing_clients`, since they depend
/// on the transient `connected` set rather than on `files`/`shares`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedFile {
    pub file_id: String,
    pub name: String,
    pub modification_time: u32,
    pub size: u32,
}
