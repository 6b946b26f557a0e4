// The orchestrator is split into smaller files to keep each concern
// readable on its own. The pieces are `include!`'d so everything
// remains in `crate::sync`.

include!("parts/01_prelude.rs");
include!("parts/02_download.rs");
include!("parts/03_upload.rs");
include!("parts/04_encryption.rs");
