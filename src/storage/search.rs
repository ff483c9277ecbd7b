use anyhow::Result;
use sqlx::{QueryBuilder, Sqlite};

use super::schema::Database;
use super::types::{JobPage, JobPosting, JobQuery};

// ============================================================================
// FTS5 Query Validation
// ============================================================================

const MAX_QUERY_LENGTH: usize = 256;
const MAX_WILDCARDS: usize = 3;
const MAX_OR_OPERATORS: usize = 5;
const MAX_PARENTHESES: usize = 5;

/// Largest page size a caller may request
pub const MAX_PAGE_SIZE: u32 = 100;

const JOB_COLUMNS: &str = "j.id, j.job_id, j.title, j.company, j.location, j.description, \
     j.category, j.job_type, j.link, j.pub_date, j.source_feed, j.created_at, j.updated_at";

/// Validate FTS5 query complexity to prevent expensive wildcard expansions.
fn validate_fts_query(query: &str) -> Result<()> {
    if query.len() > MAX_QUERY_LENGTH {
        anyhow::bail!(
            "Search query exceeds maximum length of {} characters",
            MAX_QUERY_LENGTH
        );
    }

    if query.matches('*').count() > MAX_WILDCARDS {
        anyhow::bail!(
            "Search query contains too many wildcards (max {})",
            MAX_WILDCARDS
        );
    }

    if query.to_uppercase().matches(" OR ").count() > MAX_OR_OPERATORS {
        anyhow::bail!(
            "Search query contains too many OR operators (max {})",
            MAX_OR_OPERATORS
        );
    }

    let open = query.chars().filter(|&c| c == '(').count();
    let close = query.chars().filter(|&c| c == ')').count();
    if open > MAX_PARENTHESES {
        anyhow::bail!(
            "Search query contains too many parentheses (max {})",
            MAX_PARENTHESES
        );
    }
    if open != close {
        anyhow::bail!("Search query has unbalanced parentheses");
    }

    Ok(())
}

impl Database {
    // ========================================================================
    // Listing & Search
    // ========================================================================

    /// List postings, optionally filtered by feed and free-text search.
    ///
    /// With a search term, results are ranked by FTS5 relevance (bm25) over
    /// title, company and description; if the term is not valid FTS5 syntax
    /// the query falls back to substring matching ordered by publish date.
    /// Without a search term, postings are ordered by publish date, newest first.
    pub async fn list_jobs(&self, query: &JobQuery) -> Result<JobPage> {
        let limit = query.limit.clamp(1, MAX_PAGE_SIZE);
        let page = query.page.max(1);
        let offset = i64::from(page - 1) * i64::from(limit);
        let feed = query.source_feed.as_deref();
        let search = query
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());

        let (jobs, total) = match search {
            Some(term) => {
                validate_fts_query(term)?;
                match self.search_fts(term, feed, limit, offset).await {
                    Ok(found) => found,
                    Err(e) => {
                        tracing::warn!(error = %e, query = %term, "FTS5 search failed, falling back to LIKE");
                        self.search_like(term, feed, limit, offset).await?
                    }
                }
            }
            None => self.list_by_date(feed, limit, offset).await?,
        };

        let pages = (total + i64::from(limit) - 1) / i64::from(limit);
        Ok(JobPage {
            jobs,
            total,
            pages,
            current_page: page,
        })
    }

    async fn search_fts(
        &self,
        term: &str,
        feed: Option<&str>,
        limit: u32,
        offset: i64,
    ) -> Result<(Vec<JobPosting>, i64), sqlx::Error> {
        let mut select: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {JOB_COLUMNS} FROM jobs j \
             INNER JOIN jobs_fts ON j.id = jobs_fts.rowid \
             WHERE jobs_fts MATCH "
        ));
        select.push_bind(term);
        push_feed_filter(&mut select, feed);
        select.push(" ORDER BY bm25(jobs_fts), j.pub_date DESC LIMIT ");
        select.push_bind(i64::from(limit));
        select.push(" OFFSET ");
        select.push_bind(offset);
        let jobs = select
            .build_query_as::<JobPosting>()
            .fetch_all(&self.pool)
            .await?;

        let mut count: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT COUNT(*) FROM jobs j \
             INNER JOIN jobs_fts ON j.id = jobs_fts.rowid \
             WHERE jobs_fts MATCH ",
        );
        count.push_bind(term);
        push_feed_filter(&mut count, feed);
        let total: (i64,) = count.build_query_as().fetch_one(&self.pool).await?;

        Ok((jobs, total.0))
    }

    async fn search_like(
        &self,
        term: &str,
        feed: Option<&str>,
        limit: u32,
        offset: i64,
    ) -> Result<(Vec<JobPosting>, i64)> {
        let pattern = format!("%{}%", term);

        let mut select: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {JOB_COLUMNS} FROM jobs j WHERE "));
        push_like_filter(&mut select, &pattern);
        push_feed_filter(&mut select, feed);
        select.push(" ORDER BY j.pub_date DESC, j.id DESC LIMIT ");
        select.push_bind(i64::from(limit));
        select.push(" OFFSET ");
        select.push_bind(offset);
        let jobs = select
            .build_query_as::<JobPosting>()
            .fetch_all(&self.pool)
            .await?;

        let mut count: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT COUNT(*) FROM jobs j WHERE ");
        push_like_filter(&mut count, &pattern);
        push_feed_filter(&mut count, feed);
        let total: (i64,) = count.build_query_as().fetch_one(&self.pool).await?;

        Ok((jobs, total.0))
    }

    async fn list_by_date(
        &self,
        feed: Option<&str>,
        limit: u32,
        offset: i64,
    ) -> Result<(Vec<JobPosting>, i64)> {
        let mut select: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {JOB_COLUMNS} FROM jobs j WHERE 1 = 1"));
        push_feed_filter(&mut select, feed);
        select.push(" ORDER BY j.pub_date DESC, j.id DESC LIMIT ");
        select.push_bind(i64::from(limit));
        select.push(" OFFSET ");
        select.push_bind(offset);
        let jobs = select
            .build_query_as::<JobPosting>()
            .fetch_all(&self.pool)
            .await?;

        let mut count: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) FROM jobs j WHERE 1 = 1");
        push_feed_filter(&mut count, feed);
        let total: (i64,) = count.build_query_as().fetch_one(&self.pool).await?;

        Ok((jobs, total.0))
    }
}

fn push_feed_filter<'a>(builder: &mut QueryBuilder<'a, Sqlite>, feed: Option<&'a str>) {
    if let Some(feed) = feed {
        builder.push(" AND j.source_feed = ");
        builder.push_bind(feed);
    }
}

fn push_like_filter<'a>(builder: &mut QueryBuilder<'a, Sqlite>, pattern: &'a str) {
    builder.push("(j.title LIKE ");
    builder.push_bind(pattern);
    builder.push(" OR j.company LIKE ");
    builder.push_bind(pattern);
    builder.push(" OR j.description LIKE ");
    builder.push_bind(pattern);
    builder.push(")");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{JobStore, NormalizedJob};

    const FEED_A: &str = "https://a.example.com/feed";
    const FEED_B: &str = "https://b.example.com/feed";

    async fn seeded_db() -> Database {
        let db = Database::open(":memory:").await.unwrap();
        let jobs = [
            ("j1", "Rust Engineer", "Ferris Inc", "Systems work in Rust", FEED_A, 100),
            ("j2", "Product Designer", "Pixel Co", "Design user flows", FEED_A, 300),
            ("j3", "Backend Engineer", "Rustacean Labs", "Go and Rust services", FEED_B, 200),
            ("j4", "Copywriter", "Words Ltd", "Write landing pages", FEED_B, 400),
        ];
        for (id, title, company, description, feed, pub_date) in jobs {
            db.upsert_job(&NormalizedJob {
                job_id: id.to_string(),
                title: title.to_string(),
                company: company.to_string(),
                location: "Remote".to_string(),
                description: description.to_string(),
                category: String::new(),
                job_type: String::new(),
                link: id.to_string(),
                pub_date,
                source_feed: feed.to_string(),
            })
            .await
            .unwrap();
        }
        db
    }

    fn ids(page: &JobPage) -> Vec<&str> {
        page.jobs.iter().map(|j| j.job_id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_list_orders_by_pub_date_desc() {
        let db = seeded_db().await;
        let page = db.list_jobs(&JobQuery::default()).await.unwrap();
        assert_eq!(ids(&page), vec!["j4", "j2", "j3", "j1"]);
        assert_eq!(page.total, 4);
        assert_eq!(page.pages, 1);
        assert_eq!(page.current_page, 1);
    }

    #[tokio::test]
    async fn test_list_filters_by_source_feed() {
        let db = seeded_db().await;
        let page = db
            .list_jobs(&JobQuery {
                source_feed: Some(FEED_B.to_string()),
                ..JobQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(ids(&page), vec!["j4", "j3"]);
        assert_eq!(page.total, 2);
    }

    #[tokio::test]
    async fn test_list_paginates() {
        let db = seeded_db().await;
        let page = db
            .list_jobs(&JobQuery {
                page: 2,
                limit: 3,
                ..JobQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(ids(&page), vec!["j1"]);
        assert_eq!(page.total, 4);
        assert_eq!(page.pages, 2);
        assert_eq!(page.current_page, 2);
    }

    #[tokio::test]
    async fn test_search_matches_title_company_description() {
        let db = seeded_db().await;
        let page = db
            .list_jobs(&JobQuery {
                search: Some("rust".to_string()),
                ..JobQuery::default()
            })
            .await
            .unwrap();
        let mut found = ids(&page);
        found.sort();
        assert_eq!(found, vec!["j1", "j3"]);
        assert_eq!(page.total, 2);
    }

    #[tokio::test]
    async fn test_search_combined_with_feed_filter() {
        let db = seeded_db().await;
        let page = db
            .list_jobs(&JobQuery {
                source_feed: Some(FEED_A.to_string()),
                search: Some("rust".to_string()),
                ..JobQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(ids(&page), vec!["j1"]);
    }

    #[tokio::test]
    async fn test_search_reflects_upserted_changes() {
        let db = seeded_db().await;
        db.upsert_job(&NormalizedJob {
            job_id: "j4".to_string(),
            title: "Technical Writer".to_string(),
            company: "Words Ltd".to_string(),
            location: "Remote".to_string(),
            description: "Document Kubernetes operators".to_string(),
            category: String::new(),
            job_type: String::new(),
            link: "j4".to_string(),
            pub_date: 400,
            source_feed: FEED_B.to_string(),
        })
        .await
        .unwrap();

        let search = |term: &str| JobQuery {
            search: Some(term.to_string()),
            ..JobQuery::default()
        };
        assert_eq!(ids(&db.list_jobs(&search("kubernetes")).await.unwrap()), vec!["j4"]);
        assert!(db.list_jobs(&search("landing")).await.unwrap().jobs.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_fts_syntax_falls_back_to_like() {
        let db = seeded_db().await;
        let page = db
            .list_jobs(&JobQuery {
                search: Some("\"Rust".to_string()),
                ..JobQuery::default()
            })
            .await
            .unwrap();
        // The unterminated quote is rejected by FTS5; LIKE then looks for the raw term
        assert!(page.jobs.is_empty());
        assert_eq!(page.total, 0);
    }

    #[test]
    fn test_validate_fts_query_limits() {
        assert!(validate_fts_query("rust engineer").is_ok());
        assert!(validate_fts_query(&"a".repeat(MAX_QUERY_LENGTH + 1)).is_err());
        assert!(validate_fts_query("a* b* c* d*").is_err());
        assert!(validate_fts_query("(rust").is_err());
    }
}
