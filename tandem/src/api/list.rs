//! `list`: catalog snapshot with status filters.

use crate::Result;
use crate::api::SessionApi;
use crate::catalog::Item;
use crate::server::protocol::{ListItem, ListParams, ListResponse};

/// Feedback sent with an empty listing.
pub const EMPTY_LIST_MESSAGE: &str = "no downloads found";

/// Items matching the status flags. Hidden and child items need `show_hidden`.
pub fn filter_items(items: Vec<Item>, params: &ListParams) -> Vec<Item> {
    if !params.show_completed && !params.show_pending {
        return Vec::new();
    }
    items
        .into_iter()
        .filter(|item| params.show_hidden || !(item.hidden || item.children))
        .filter(|item| {
            if item.is_complete() {
                params.show_completed
            } else {
                params.show_pending
            }
        })
        .collect()
}

impl SessionApi {
    pub fn list(&self, params: ListParams) -> Result<ListResponse> {
        let items: Vec<ListItem> = filter_items(self.manager.list_items(), &params)
            .iter()
            .map(ListItem::from)
            .collect();
        let message = items.is_empty().then(|| EMPTY_LIST_MESSAGE.to_string());
        Ok(ListResponse { items, message })
    }
}
