pub mod download;
pub mod filename;
pub mod http;
pub mod id;
pub mod side_fetch;
pub mod temp_path;
