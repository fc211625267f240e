//! Page-numbered listings (a user's posts, a follower list)

use super::{render_url, required_template, CrawlMode, ItemFollowUp, ModeTools, Step};
use crate::config::ModeEntry;
use crate::crawler::intent::{FetchIntent, IntentKind, Scope};
use crate::crawler::pagination::{PaginationDedupTracker, TargetKey};
use crate::crawler::parser::{ClassifyError, PayloadClassifier};
use crate::crawler::retry::BudgetTag;
use crate::HarvestError;
use std::sync::Arc;
use tracing::info;

/// Requests page after page of a seed's list until a page adds nothing new
#[derive(Debug)]
pub struct FlatListing {
    name: String,
    listing_url: String,
    dedup: PaginationDedupTracker,
    classifier: Arc<dyn PayloadClassifier>,
    follow_up: ItemFollowUp,
}

impl FlatListing {
    pub fn new(entry: &ModeEntry, classifier: Arc<dyn PayloadClassifier>) -> Result<Self, HarvestError> {
        Ok(Self {
            name: entry.name.clone(),
            listing_url: required_template(entry, "listing-url", &entry.listing_url)?,
            dedup: PaginationDedupTracker::new(),
            follow_up: ItemFollowUp::new(entry, Arc::clone(&classifier)),
            classifier,
        })
    }

    fn page_intent(&self, target: &str, page: u32) -> Option<FetchIntent> {
        let page_number = page.to_string();
        let url = render_url(
            &self.listing_url,
            &[("id", target), ("key", target), ("page", page_number.as_str())],
        )?;
        Some(FetchIntent::new(
            url,
            IntentKind::Listing,
            BudgetTag::Search,
            Scope::Flat {
                target: target.to_string(),
                page,
            },
        ))
    }

    fn finish(&mut self, target: &str, page: u32, reason: &str) {
        let key = TargetKey::top_level(target);
        info!(
            target_id = target,
            pages = page,
            items = self.dedup.seen_count(&key),
            reason,
            "List finished"
        );
        self.dedup.release(&key);
    }

    fn on_listing(&mut self, intent: &FetchIntent, body: &[u8]) -> Result<Step, ClassifyError> {
        let Scope::Flat { target, page } = intent.scope() else {
            return Ok(Step::default());
        };

        let listing = self.classifier.classify_listing(body)?;
        if listing.no_results || listing.is_empty_page() {
            self.finish(target, *page, "empty");
            return Ok(Step::default());
        }

        let observation = self
            .dedup
            .observe_page(&TargetKey::top_level(target.as_str()), listing.item_ids());

        let mut step = Step::default();
        for item in listing
            .items
            .iter()
            .filter(|item| observation.new_item_ids.contains(&item.id))
        {
            step.extend(self.follow_up.follow(target, item, None));
        }

        if observation.should_continue {
            if let Some(mut next) = self.page_intent(target, page + 1) {
                next.headers = intent.headers.clone();
                step.intents.push(next);
            }
        } else {
            self.finish(target, *page, "no-new-items");
        }

        Ok(step)
    }
}

impl CrawlMode for FlatListing {
    fn name(&self) -> &str {
        &self.name
    }

    fn seed(&mut self, ids: &[String]) -> Vec<FetchIntent> {
        ids.iter().filter_map(|id| self.page_intent(id, 1)).collect()
    }

    fn on_page(
        &mut self,
        intent: &FetchIntent,
        body: &[u8],
        _tools: &ModeTools<'_>,
    ) -> Result<Step, ClassifyError> {
        match intent.kind {
            IntentKind::Listing => self.on_listing(intent, body),
            IntentKind::Detail => self.follow_up.on_detail(intent, body),
            IntentKind::LongText => self.follow_up.on_long_text(intent, body),
            IntentKind::Replies => Ok(Step::default()),
        }
    }

    fn on_abandon(&mut self, intent: &FetchIntent, _tools: &ModeTools<'_>) -> Step {
        match (intent.kind, intent.scope()) {
            (IntentKind::Listing, Scope::Flat { target, page }) => {
                self.finish(target, *page, "abandoned");
                Step::default()
            }
            (IntentKind::LongText, _) => self.follow_up.on_long_text_abandoned(intent),
            _ => Step::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{body, entry};
    use super::*;
    use crate::config::ModeKind;
    use crate::crawler::parser::JsonPointerClassifier;
    use crate::crawler::retry::RetryBudgetController;
    use serde_json::json;

    fn mode(with_detail: bool) -> FlatListing {
        let mut entry = entry(ModeKind::FlatList);
        if !with_detail {
            entry.detail_url = None;
        }
        FlatListing::new(&entry, Arc::new(JsonPointerClassifier::new(entry.payload.clone())))
            .unwrap()
    }

    fn page_of(ids: &[&str]) -> Vec<u8> {
        let list: Vec<_> = ids.iter().map(|id| json!({"id": id})).collect();
        body(json!({"data": {"list": list}}))
    }

    #[test]
    fn test_pages_until_nothing_new() {
        let mut mode = mode(false);
        let retry = RetryBudgetController::default();
        let tools = ModeTools { retry: &retry };
        let first = mode.seed(&["1669879400".to_string()]).remove(0);
        assert_eq!(first.url, "https://api.example.com/list?uid=1669879400&page=1");

        let step = mode.on_page(&first, &page_of(&["a", "b"]), &tools).unwrap();
        assert_eq!(step.items.len(), 2);
        assert_eq!(step.items[0].seed, "1669879400");
        let second = step.intents.into_iter().next().unwrap();
        assert!(second.url.ends_with("page=2"));

        let step = mode.on_page(&second, &page_of(&["b", "a"]), &tools).unwrap();
        assert!(step.is_empty());
    }

    #[test]
    fn test_empty_page_ends_list() {
        let mut mode = mode(false);
        let retry = RetryBudgetController::default();
        let tools = ModeTools { retry: &retry };
        let first = mode.seed(&["42".to_string()]).remove(0);

        let step = mode.on_page(&first, &page_of(&[]), &tools).unwrap();
        assert!(step.is_empty());
    }

    #[test]
    fn test_items_follow_up_with_detail() {
        let mut mode = mode(true);
        let retry = RetryBudgetController::default();
        let tools = ModeTools { retry: &retry };
        let first = mode.seed(&["42".to_string()]).remove(0);

        let step = mode.on_page(&first, &page_of(&["a"]), &tools).unwrap();
        assert!(step.items.is_empty());
        let kinds: Vec<_> = step.intents.iter().map(|i| i.kind).collect();
        assert_eq!(kinds, vec![IntentKind::Detail, IntentKind::Listing]);
    }
}
