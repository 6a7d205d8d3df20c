use serde::{Deserialize, Serialize};

const DEFAULT_PAGE_SIZE: usize = 20;
const MAX_PAGE_SIZE: usize = 200;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// 1-based page request as sent by a listing endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PageQuery {
    pub page: usize,
    pub size: usize,
    pub sort: Option<String>,
    pub order: SortOrder,
}

impl Default for PageQuery {
    fn default() -> Self {
        Self {
            page: 1,
            size: DEFAULT_PAGE_SIZE,
            sort: None,
            order: SortOrder::Asc,
        }
    }
}

impl PageQuery {
    pub fn sorted_by(mut self, field: &str, order: SortOrder) -> Self {
        self.sort = Some(field.to_string());
        self.order = order;
        self
    }

    pub fn page(mut self, page: usize, size: usize) -> Self {
        self.page = page;
        self.size = size;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
}

/// Cuts one page out of already-sorted `items`.
pub fn paginate<T>(items: Vec<T>, query: &PageQuery) -> Page<T> {
    let total = items.len();
    let size = match query.size {
        0 => DEFAULT_PAGE_SIZE,
        n => n.min(MAX_PAGE_SIZE),
    };
    let page = query.page.max(1);
    let items = items
        .into_iter()
        .skip((page - 1).saturating_mul(size))
        .take(size)
        .collect();
    Page { items, total }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_are_one_based() {
        let q = PageQuery::default().page(2, 3);
        let page = paginate((1..=7).collect(), &q);
        assert_eq!(page.items, vec![4, 5, 6]);
        assert_eq!(page.total, 7);

        let past_end = paginate((1..=7).collect::<Vec<i32>>(), &PageQuery::default().page(9, 3));
        assert!(past_end.items.is_empty());
        assert_eq!(past_end.total, 7);
    }

    #[test]
    fn zero_page_and_size_use_defaults() {
        let page = paginate((0..50).collect::<Vec<i32>>(), &PageQuery::default().page(0, 0));
        assert_eq!(page.items.len(), DEFAULT_PAGE_SIZE);
        assert_eq!(page.items[0], 0);
    }

    #[test]
    fn query_deserializes_with_defaults() {
        let q: PageQuery = serde_json::from_str(r#"{"sort":"name","order":"desc"}"#).unwrap();
        assert_eq!(q.page, 1);
        assert_eq!(q.size, DEFAULT_PAGE_SIZE);
        assert_eq!(q.order, SortOrder::Desc);
    }
}
