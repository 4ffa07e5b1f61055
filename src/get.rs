//! Aggregate record retrieval by contact id.
//!
//! Fetches one contact's record from the published snapshot together with
//! the base-relation details the aggregate leaves out. Used by `civic get`.

use anyhow::{bail, Result};
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;
use crate::models::AggregateRecord;
use crate::search::record_from_row;

#[derive(Debug, Clone, Serialize)]
pub struct ContactDetail {
    #[serde(flatten)]
    pub record: AggregateRecord,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    pub department: Option<String>,
    pub created_at: Option<String>,
    pub place: Option<PlaceDetail>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlaceDetail {
    pub place_id: String,
    pub state_abbr: Option<String>,
    pub county_fips: Option<String>,
    pub geoid: Option<String>,
    pub parent_place_id: Option<String>,
    pub address: Option<String>,
}

/// Look up `contact_id` in the current snapshot.
pub async fn get_contact(pool: &SqlitePool, contact_id: &str) -> Result<Option<ContactDetail>> {
    let row = sqlx::query(
        r#"
        SELECT r.contact_id, r.emails, r.title, r.display_name, r.population, r.lat, r.long,
               r.tech_names, r.customer_a_id, r.customer_b_id,
               c.first_name, c.last_name, c.phone, c.department, c.created_at, c.place_id
        FROM aggregate_records r
        LEFT JOIN contacts c ON c.id = r.contact_id
        WHERE r.version = (SELECT version FROM aggregate_current WHERE id = 1)
          AND r.contact_id = ?
        "#,
    )
    .bind(contact_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let place_id: Option<String> = row.get("place_id");
    let place = match place_id {
        Some(ref id) => sqlx::query(
            "SELECT place_id, state_abbr, county_fips, geoid, parent_place_id, address FROM places WHERE place_id = ?",
        )
        .bind(id)
        .fetch_optional(pool)
        .await?
        .map(|p| PlaceDetail {
            place_id: p.get("place_id"),
            state_abbr: p.get("state_abbr"),
            county_fips: p.get("county_fips"),
            geoid: p.get("geoid"),
            parent_place_id: p.get("parent_place_id"),
            address: p.get("address"),
        }),
        None => None,
    };

    Ok(Some(ContactDetail {
        record: record_from_row(&row),
        first_name: row.get("first_name"),
        last_name: row.get("last_name"),
        phone: row.get("phone"),
        department: row.get("department"),
        created_at: row.get("created_at"),
        place,
    }))
}

/// CLI entry point: print one record, or fail when it does not exist.
pub async fn run_get(config: &Config, contact_id: &str, json: bool) -> Result<()> {
    let pool = db::connect(config).await?;
    let detail = get_contact(&pool, contact_id).await?;
    pool.close().await;

    let Some(detail) = detail else {
        bail!("contact not found: {}", contact_id);
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&detail)?);
        return Ok(());
    }

    let rec = &detail.record;
    let name = [detail.first_name.as_deref(), detail.last_name.as_deref()]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ");

    println!("--- Contact ---");
    println!("id:            {}", rec.contact_id);
    if !name.is_empty() {
        println!("name:          {}", name);
    }
    println!("emails:        {}", rec.emails.as_deref().unwrap_or("-"));
    println!("title:         {}", rec.title.as_deref().unwrap_or("-"));
    if let Some(ref dept) = detail.department {
        println!("department:    {}", dept);
    }
    if let Some(ref phone) = detail.phone {
        println!("phone:         {}", phone);
    }
    if let Some(ref created) = detail.created_at {
        println!("created_at:    {}", created);
    }
    println!();

    println!("--- Entity ---");
    match detail.place {
        Some(ref place) => {
            println!("place_id:      {}", place.place_id);
            println!("display_name:  {}", rec.display_name.as_deref().unwrap_or("-"));
            if let Some(p) = rec.population {
                println!("population:    {}", p);
            }
            if let (Some(lat), Some(long)) = (rec.lat, rec.long) {
                println!("location:      {}, {}", lat, long);
            }
            if let Some(ref s) = place.state_abbr {
                println!("state:         {}", s);
            }
            if let Some(ref f) = place.county_fips {
                println!("county_fips:   {}", f);
            }
            if let Some(ref g) = place.geoid {
                println!("geoid:         {}", g);
            }
            if let Some(ref parent) = place.parent_place_id {
                println!("parent:        {}", parent);
            }
            if let Some(ref a) = place.address {
                println!("address:       {}", a);
            }
        }
        None => println!("(none)"),
    }
    println!();

    println!("--- Tech & CRM ---");
    println!(
        "tech_names:    {}",
        if rec.tech_names.is_empty() { "-" } else { rec.tech_names.as_str() }
    );
    println!("customer_a_id: {}", rec.customer_a_id.as_deref().unwrap_or("-"));
    println!("customer_b_id: {}", rec.customer_b_id.as_deref().unwrap_or("-"));

    Ok(())
}
