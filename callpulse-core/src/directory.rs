//! Assistant/template directory
//!
//! Resolves an assistant to the template it was built from, its owner and the
//! template category. Entries are written by the CRUD handlers that own
//! assistants; the pipeline only reads them.

use crate::error::Result;
use crate::types::AssistantProfile;

pub trait TemplateDirectory: Send + Sync {
    /// Look up an assistant, `None` when it is not registered.
    fn lookup(&self, assistant_id: &str) -> Result<Option<AssistantProfile>>;
}
