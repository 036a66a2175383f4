use fleetwarden_shared::PageInfo;
use sea_orm::{ConnectionTrait, EntityTrait, FromQueryResult, PaginatorTrait, Select};

use crate::error::ServiceResult;

pub const DEFAULT_PAGE_SIZE: u64 = 10;
pub const MAX_PAGE_SIZE: u64 = 50;

/// Normalised paging window. The requested page is clamped into
/// `[1, total_pages]` rather than rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pager {
    pub page_no: u64,
    pub page_size: u64,
    pub total_pages: u64,
    pub total_rows: u64,
}

impl Pager {
    pub fn new(page_size: i64, page_no: i64, total_rows: u64) -> Self {
        let page_size = if page_size <= 0 {
            DEFAULT_PAGE_SIZE
        } else {
            (page_size as u64).min(MAX_PAGE_SIZE)
        };
        let total_pages = total_rows.div_ceil(page_size);
        let page_no = if page_no <= 0 {
            1
        } else {
            (page_no as u64).min(total_pages.max(1))
        };

        Self {
            page_no,
            page_size,
            total_pages,
            total_rows,
        }
    }

    pub fn offset(&self) -> u64 {
        (self.page_no - 1) * self.page_size
    }

    pub fn info(&self) -> PageInfo {
        PageInfo {
            page_no: self.page_no,
            page_size: self.page_size,
            total_pages: self.total_pages,
        }
    }
}

/// Runs `select` one page at a time using the clamped window.
pub async fn fetch_page<C, E>(
    db: &C,
    select: Select<E>,
    page_size: i64,
    page_no: i64,
) -> ServiceResult<(Pager, Vec<E::Model>)>
where
    C: ConnectionTrait,
    E: EntityTrait,
    E::Model: FromQueryResult + Sized + Send + Sync,
{
    let total = select.clone().count(db).await?;
    let pager = Pager::new(page_size, page_no, total);
    if total == 0 {
        return Ok((pager, Vec::new()));
    }
    let rows = select
        .paginate(db, pager.page_size)
        .fetch_page(pager.page_no - 1)
        .await?;
    Ok((pager, rows))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_no_is_clamped_not_rejected() {
        assert_eq!(Pager::new(10, 0, 25).page_no, 1);
        let last = Pager::new(10, 100, 25);
        assert_eq!(last.page_no, 3);
        assert_eq!(last.total_pages, 3);
        assert_eq!(last.offset(), 20);
    }

    #[test]
    fn page_size_defaults_and_caps() {
        assert_eq!(Pager::new(0, 1, 5).page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(Pager::new(-3, 1, 5).page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(Pager::new(500, 1, 5).page_size, MAX_PAGE_SIZE);
    }

    #[test]
    fn empty_table_yields_first_page() {
        let p = Pager::new(10, 7, 0);
        assert_eq!(p.page_no, 1);
        assert_eq!(p.total_pages, 0);
        assert_eq!(p.offset(), 0);
    }
}
