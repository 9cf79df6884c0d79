//! Package-name substring search

use super::entry::CatalogEntry;
use super::CatalogError;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use sqlx::SqlitePool;

/// Rows fetched per round trip while the stream is consumed
const PAGE_SIZE: i64 = 256;

// SQLite's LIKE folds case for ASCII only. Both queries follow
// idx_apks_pkg_name_sha256; later pages seek past the previous page's last
// (pkg_name, sha256) instead of re-reading the table.
const FIRST_PAGE_SQL: &str = r#"
    SELECT sha256, sha1, md5, dex_date, apk_size, pkg_name, vercode,
           vt_detection, vt_scan_date, dex_size, markets
    FROM apks
    WHERE pkg_name LIKE ?1 ESCAPE '\'
    ORDER BY pkg_name, sha256
    LIMIT ?2
"#;

const NEXT_PAGE_SQL: &str = r#"
    SELECT sha256, sha1, md5, dex_date, apk_size, pkg_name, vercode,
           vt_detection, vt_scan_date, dex_size, markets
    FROM apks
    WHERE pkg_name LIKE ?1 ESCAPE '\'
      AND (pkg_name, sha256) > (?3, ?4)
    ORDER BY pkg_name, sha256
    LIMIT ?2
"#;

enum Cursor {
    Start,
    After { pkg_name: String, sha256: String },
    Done,
}

/// `%needle%` with LIKE wildcards in the needle taken literally
pub(crate) fn like_pattern(needle: &str) -> String {
    let mut pattern = String::with_capacity(needle.len() + 2);
    pattern.push('%');
    for c in needle.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// Lazy stream of matches; nothing runs until it is polled
pub(crate) fn search(
    pool: SqlitePool,
    needle: &str,
) -> BoxStream<'static, Result<CatalogEntry, CatalogError>> {
    let pattern = like_pattern(needle);

    stream::try_unfold(Cursor::Start, move |cursor| {
        let pool = pool.clone();
        let pattern = pattern.clone();
        async move {
            let query = match cursor {
                Cursor::Done => return Ok(None),
                Cursor::Start => sqlx::query_as(FIRST_PAGE_SQL).bind(pattern).bind(PAGE_SIZE),
                Cursor::After { pkg_name, sha256 } => sqlx::query_as(NEXT_PAGE_SQL)
                    .bind(pattern)
                    .bind(PAGE_SIZE)
                    .bind(pkg_name)
                    .bind(sha256),
            };
            let page: Vec<CatalogEntry> = query.fetch_all(&pool).await?;

            if page.is_empty() {
                return Ok(None);
            }

            let next = match page.last() {
                Some(last) if page.len() as i64 == PAGE_SIZE => Cursor::After {
                    pkg_name: last.pkg_name.clone(),
                    sha256: last.sha256.to_string(),
                },
                _ => Cursor::Done,
            };
            Ok::<_, CatalogError>(Some((page, next)))
        }
    })
    .map_ok(|page| stream::iter(page.into_iter().map(Ok::<CatalogEntry, CatalogError>)))
    .try_flatten()
    .boxed()
}
