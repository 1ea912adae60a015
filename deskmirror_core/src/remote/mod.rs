//! Remote helpdesk seam.
//!
//! The engine only talks to the remote system through `RemoteApi`; concrete
//! transports (HTTP, test fakes) implement it.

pub mod error;
pub mod traits;

/// Remote API paths shared by the sync, refresh, merge and write paths.
pub mod paths {
    use crate::entities::models::RemoteId;

    pub const CONTACT_MERGE: &str = "/api/v2/contacts/merge";
    pub const TICKET_MERGE: &str = "/api/v2/tickets/merge";
    pub const CANNED_RESPONSE_FOLDERS: &str = "/api/v2/canned_response_folders";

    pub fn ticket_conversations(ticket: RemoteId) -> String {
        format!("/api/v2/tickets/{ticket}/conversations")
    }

    pub fn folder_responses(folder: RemoteId) -> String {
        format!("{CANNED_RESPONSE_FOLDERS}/{folder}/responses")
    }
}
