pub mod git;

pub use git::{
    collect_changes, collect_tracked, head_commit, history_scan, is_valid_commit,
    last_commit_for_file, list_changes, list_commits, list_tracked_files, parse_change,
    pipe_file_at_commit, read_file_at_commit, unquote_path, zip_files_at_commit, Change,
    CommitInfo, HistoryScan,
};
