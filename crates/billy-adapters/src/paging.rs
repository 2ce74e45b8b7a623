use std::future::Future;

use billy_core::CandidateItem;

use crate::FetchError;

/// One continuation page of an API listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Page {
    pub items: Vec<CandidateItem>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOrder {
    /// Listing is sorted by `discovered_at` descending; the first item older than the
    /// watermark means every later page is older too.
    NewestFirst,
    /// No usable order; old items are filtered but every page is read.
    Unordered,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Collected {
    pub items: Vec<CandidateItem>,
    pub pages: usize,
    pub stopped_early: bool,
}

/// Walks continuation pages until they run out or, for [`PageOrder::NewestFirst`], until an
/// item older than `watermark` shows up.
pub async fn collect_pages<F, Fut>(
    watermark: i64,
    order: PageOrder,
    mut next_page: F,
) -> Result<Collected, FetchError>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<Page, FetchError>>,
{
    let mut out = Collected::default();
    let mut token: Option<String> = None;

    loop {
        let page = next_page(token.take()).await?;
        out.pages += 1;

        for item in page.items {
            if item.discovered_at < watermark {
                match order {
                    PageOrder::NewestFirst => {
                        out.stopped_early = true;
                        return Ok(out);
                    }
                    PageOrder::Unordered => continue,
                }
            }
            out.items.push(item);
        }

        match page.next_page_token {
            Some(next) if !next.is_empty() => token = Some(next),
            _ => return Ok(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::future::ready;

    use billy_core::CanonicalLink;

    use super::*;

    fn item(id: &str, ts: i64) -> CandidateItem {
        CandidateItem {
            title: id.to_string(),
            link: CanonicalLink::from_parts("youtube", id).unwrap(),
            discovered_at: ts,
            image: None,
        }
    }

    fn page(items: Vec<CandidateItem>, next: Option<&str>) -> Page {
        Page {
            items,
            next_page_token: next.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn newest_first_stops_at_first_item_older_than_watermark() {
        let mut pages = VecDeque::from([
            page(vec![item("a", 1300), item("b", 1200)], Some("p2")),
            page(vec![item("c", 1100), item("d", 900)], Some("p3")),
            page(vec![item("e", 800)], None),
        ]);
        let mut tokens = Vec::new();

        let collected = collect_pages(1000, PageOrder::NewestFirst, |token| {
            tokens.push(token);
            ready(Ok(pages.pop_front().expect("no page requested past the stop")))
        })
        .await
        .unwrap();

        let links: Vec<_> = collected.items.iter().map(|i| i.link.native_id().to_string()).collect();
        assert_eq!(links, ["a", "b", "c"]);
        assert!(collected.stopped_early);
        assert_eq!(collected.pages, 2);
        assert_eq!(tokens, [None, Some("p2".to_string())]);
    }

    #[tokio::test]
    async fn unordered_reads_every_page_and_filters() {
        let mut pages = VecDeque::from([
            page(vec![item("a", 500), item("b", 1500)], Some("p2")),
            page(vec![item("c", 2000), item("d", 10)], Some("")),
        ]);

        let collected = collect_pages(1000, PageOrder::Unordered, |_| {
            ready(Ok(pages.pop_front().unwrap()))
        })
        .await
        .unwrap();

        let links: Vec<_> = collected.items.iter().map(|i| i.link.native_id().to_string()).collect();
        assert_eq!(links, ["b", "c"]);
        assert!(!collected.stopped_early);
        assert_eq!(collected.pages, 2);
    }

    #[tokio::test]
    async fn page_error_aborts_the_whole_fetch() {
        let mut calls = 0;
        let result = collect_pages(0, PageOrder::NewestFirst, |_| {
            calls += 1;
            if calls == 1 {
                ready(Ok(page(vec![item("a", 10)], Some("p2"))))
            } else {
                ready(Err(FetchError::Decode("truncated json".into())))
            }
        })
        .await;
        assert!(matches!(result, Err(FetchError::Decode(_))));
    }
}
