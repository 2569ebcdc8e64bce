//! Category operations

use rusqlite::{params, OptionalExtension};

use super::Database;
use crate::error::Result;
use crate::models::Category;

impl Database {
    /// Create a category for an organization
    pub fn create_category(
        &self,
        organization_id: i64,
        name: &str,
        parent_id: Option<i64>,
        color: Option<&str>,
        icon: Option<&str>,
    ) -> Result<i64> {
        let conn = self.conn()?;

        conn.execute(
            r#"
            INSERT INTO categories (organization_id, name, parent_id, color, icon)
            VALUES (?, ?, ?, ?, ?)
            "#,
            params![organization_id, name, parent_id, color, icon],
        )?;

        Ok(conn.last_insert_rowid())
    }

    /// Seed a default set of categories if the organization has none
    pub fn seed_default_categories(&self, organization_id: i64) -> Result<usize> {
        const DEFAULTS: &[(&str, &str)] = &[
            ("Dining", "#e67e22"),
            ("Groceries", "#27ae60"),
            ("Transport", "#2980b9"),
            ("Travel", "#8e44ad"),
            ("Shopping", "#c0392b"),
            ("Subscriptions", "#16a085"),
            ("Utilities", "#7f8c8d"),
            ("Income", "#2ecc71"),
            ("Other", "#95a5a6"),
        ];

        if !self.list_categories(organization_id)?.is_empty() {
            return Ok(0);
        }

        for (name, color) in DEFAULTS {
            self.create_category(organization_id, name, None, Some(color), None)?;
        }

        Ok(DEFAULTS.len())
    }

    /// Get a category by ID
    pub fn get_category(&self, id: i64) -> Result<Option<Category>> {
        let conn = self.conn()?;

        let category = conn
            .query_row(
                "SELECT id, organization_id, name, parent_id, color, icon FROM categories WHERE id = ?",
                params![id],
                |row| {
                    Ok(Category {
                        id: row.get(0)?,
                        organization_id: row.get(1)?,
                        name: row.get(2)?,
                        parent_id: row.get(3)?,
                        color: row.get(4)?,
                        icon: row.get(5)?,
                    })
                },
            )
            .optional()?;

        Ok(category)
    }

    /// List an organization's categories by name
    pub fn list_categories(&self, organization_id: i64) -> Result<Vec<Category>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, organization_id, name, parent_id, color, icon
            FROM categories
            WHERE organization_id = ?
            ORDER BY name
            "#,
        )?;

        let categories = stmt
            .query_map(params![organization_id], |row| {
                Ok(Category {
                    id: row.get(0)?,
                    organization_id: row.get(1)?,
                    name: row.get(2)?,
                    parent_id: row.get(3)?,
                    color: row.get(4)?,
                    icon: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(categories)
    }

    /// Resolve a category by name (case-insensitive) within an organization
    pub fn find_category_by_name(&self, organization_id: i64, name: &str) -> Result<Option<Category>> {
        Ok(self
            .list_categories(organization_id)?
            .into_iter()
            .find(|c| c.name.eq_ignore_ascii_case(name.trim())))
    }

    /// Whether a category belongs to an organization
    pub fn category_belongs_to(&self, category_id: i64, organization_id: i64) -> Result<bool> {
        Ok(self
            .get_category(category_id)?
            .is_some_and(|c| c.organization_id == organization_id))
    }
}
