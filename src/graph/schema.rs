//! Static entity schema: which document fields are scalar attributes and which
//! reference other entities.
//!
//! The upsert engine only follows references listed here, so every reference
//! field the source API returns must appear in these tables.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SwgraphError;

/// Closed set of entity kinds stored in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    Film,
    Person,
    Planet,
    Species,
    Starship,
    Vehicle,
    Director,
    Producer,
    Manufacturer,
    Climate,
    Terrain,
    StarshipClass,
    VehicleClass,
}

impl EntityKind {
    pub const ALL: [EntityKind; 13] = [
        EntityKind::Film,
        EntityKind::Person,
        EntityKind::Planet,
        EntityKind::Species,
        EntityKind::Starship,
        EntityKind::Vehicle,
        EntityKind::Director,
        EntityKind::Producer,
        EntityKind::Manufacturer,
        EntityKind::Climate,
        EntityKind::Terrain,
        EntityKind::StarshipClass,
        EntityKind::VehicleClass,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Film => "Film",
            EntityKind::Person => "Person",
            EntityKind::Planet => "Planet",
            EntityKind::Species => "Species",
            EntityKind::Starship => "Starship",
            EntityKind::Vehicle => "Vehicle",
            EntityKind::Director => "Director",
            EntityKind::Producer => "Producer",
            EntityKind::Manufacturer => "Manufacturer",
            EntityKind::Climate => "Climate",
            EntityKind::Terrain => "Terrain",
            EntityKind::StarshipClass => "StarshipClass",
            EntityKind::VehicleClass => "VehicleClass",
        }
    }

    /// Tag kinds are keyed by their own value and have nothing to fetch.
    pub fn is_tag(self) -> bool {
        matches!(
            self,
            EntityKind::Director
                | EntityKind::Producer
                | EntityKind::Manufacturer
                | EntityKind::Climate
                | EntityKind::Terrain
                | EntityKind::StarshipClass
                | EntityKind::VehicleClass
        )
    }

    /// Document field holding the entity's natural key.
    pub fn key_field(self) -> &'static str {
        if self.is_tag() {
            "name"
        } else {
            "url"
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = SwgraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| SwgraphError::UnknownKind(s.to_string()))
    }
}

/// How a scalar attribute is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    Text,
    /// Numeric strings become integers; anything else ("unknown") stays text.
    Integer,
    /// Numeric strings become floating point numbers.
    Number,
    /// ISO-8601 date or timestamp kept as text.
    Date,
}

/// Which way a reference edge points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// entity -> referenced entity
    Outgoing,
    /// referenced entity -> entity
    Incoming,
}

/// Target of a reference field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefSpec {
    pub target: EntityKind,
    pub rel_type: &'static str,
    pub direction: Direction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    Scalar(ScalarType),
    /// One key or null.
    Single(RefSpec),
    /// A list of keys.
    Multi(RefSpec),
    /// A comma-joined string of tag values.
    Tags(RefSpec),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub cardinality: Cardinality,
}

impl FieldSpec {
    pub fn reference(&self) -> Option<&RefSpec> {
        match &self.cardinality {
            Cardinality::Scalar(_) => None,
            Cardinality::Single(r) | Cardinality::Multi(r) | Cardinality::Tags(r) => Some(r),
        }
    }

    pub fn target_kind(&self) -> Option<EntityKind> {
        self.reference().map(|r| r.target)
    }
}

const fn scalar(name: &'static str, ty: ScalarType) -> FieldSpec {
    FieldSpec { name, cardinality: Cardinality::Scalar(ty) }
}

const fn text(name: &'static str) -> FieldSpec {
    scalar(name, ScalarType::Text)
}

const fn int(name: &'static str) -> FieldSpec {
    scalar(name, ScalarType::Integer)
}

const fn num(name: &'static str) -> FieldSpec {
    scalar(name, ScalarType::Number)
}

const fn date(name: &'static str) -> FieldSpec {
    scalar(name, ScalarType::Date)
}

const fn rs(target: EntityKind, rel_type: &'static str, direction: Direction) -> RefSpec {
    RefSpec { target, rel_type, direction }
}

const fn single(name: &'static str, target: EntityKind, rel_type: &'static str, direction: Direction) -> FieldSpec {
    FieldSpec { name, cardinality: Cardinality::Single(rs(target, rel_type, direction)) }
}

const fn multi(name: &'static str, target: EntityKind, rel_type: &'static str, direction: Direction) -> FieldSpec {
    FieldSpec { name, cardinality: Cardinality::Multi(rs(target, rel_type, direction)) }
}

const fn tags(name: &'static str, target: EntityKind, rel_type: &'static str) -> FieldSpec {
    FieldSpec { name, cardinality: Cardinality::Tags(rs(target, rel_type, Direction::Outgoing)) }
}

use Direction::{Incoming, Outgoing};
use EntityKind::*;

pub const APPEARS_IN: &str = "APPEARS_IN";
pub const PILOTS: &str = "PILOTS";
pub const IS_FROM: &str = "IS_FROM";
pub const OF_SPECIES: &str = "OF_SPECIES";
pub const DIRECTED_BY: &str = "DIRECTED_BY";
pub const PRODUCED_BY: &str = "PRODUCED_BY";
pub const MANUFACTURED_BY: &str = "MANUFACTURED_BY";
pub const HAS_CLIMATE: &str = "HAS_CLIMATE";
pub const HAS_TERRAIN: &str = "HAS_TERRAIN";
pub const HAS_CLASS: &str = "HAS_CLASS";

static FILM_FIELDS: &[FieldSpec] = &[
    text("title"),
    int("episode_id"),
    text("opening_crawl"),
    date("release_date"),
    date("created"),
    date("edited"),
    tags("director", Director, DIRECTED_BY),
    tags("producer", Producer, PRODUCED_BY),
    multi("characters", Person, APPEARS_IN, Incoming),
    multi("planets", Planet, APPEARS_IN, Incoming),
    multi("starships", Starship, APPEARS_IN, Incoming),
    multi("vehicles", Vehicle, APPEARS_IN, Incoming),
    multi("species", Species, APPEARS_IN, Incoming),
];

static PERSON_FIELDS: &[FieldSpec] = &[
    text("name"),
    int("height"),
    num("mass"),
    text("hair_color"),
    text("skin_color"),
    text("eye_color"),
    text("birth_year"),
    text("gender"),
    date("created"),
    date("edited"),
    single("homeworld", Planet, IS_FROM, Outgoing),
    multi("films", Film, APPEARS_IN, Outgoing),
    multi("species", Species, OF_SPECIES, Outgoing),
    multi("starships", Starship, PILOTS, Outgoing),
    multi("vehicles", Vehicle, PILOTS, Outgoing),
];

static PLANET_FIELDS: &[FieldSpec] = &[
    text("name"),
    int("rotation_period"),
    int("orbital_period"),
    int("diameter"),
    text("gravity"),
    num("surface_water"),
    int("population"),
    date("created"),
    date("edited"),
    tags("climate", Climate, HAS_CLIMATE),
    tags("terrain", Terrain, HAS_TERRAIN),
    multi("residents", Person, IS_FROM, Incoming),
    multi("films", Film, APPEARS_IN, Outgoing),
];

static SPECIES_FIELDS: &[FieldSpec] = &[
    text("name"),
    text("classification"),
    text("designation"),
    int("average_height"),
    text("skin_colors"),
    text("hair_colors"),
    text("eye_colors"),
    int("average_lifespan"),
    text("language"),
    date("created"),
    date("edited"),
    single("homeworld", Planet, IS_FROM, Outgoing),
    multi("people", Person, OF_SPECIES, Incoming),
    multi("films", Film, APPEARS_IN, Outgoing),
];

static STARSHIP_FIELDS: &[FieldSpec] = &[
    text("name"),
    text("model"),
    int("cost_in_credits"),
    num("length"),
    int("max_atmosphering_speed"),
    int("crew"),
    int("passengers"),
    int("cargo_capacity"),
    text("consumables"),
    num("hyperdrive_rating"),
    int("MGLT"),
    date("created"),
    date("edited"),
    tags("manufacturer", Manufacturer, MANUFACTURED_BY),
    tags("starship_class", StarshipClass, HAS_CLASS),
    multi("pilots", Person, PILOTS, Incoming),
    multi("films", Film, APPEARS_IN, Outgoing),
];

static VEHICLE_FIELDS: &[FieldSpec] = &[
    text("name"),
    text("model"),
    int("cost_in_credits"),
    num("length"),
    int("max_atmosphering_speed"),
    int("crew"),
    int("passengers"),
    int("cargo_capacity"),
    text("consumables"),
    date("created"),
    date("edited"),
    tags("manufacturer", Manufacturer, MANUFACTURED_BY),
    tags("vehicle_class", VehicleClass, HAS_CLASS),
    multi("pilots", Person, PILOTS, Incoming),
    multi("films", Film, APPEARS_IN, Outgoing),
];

/// Ordered field table for a kind. Tag kinds have no fields beyond their key.
pub fn fields_of(kind: EntityKind) -> &'static [FieldSpec] {
    match kind {
        Film => FILM_FIELDS,
        Person => PERSON_FIELDS,
        Planet => PLANET_FIELDS,
        Species => SPECIES_FIELDS,
        Starship => STARSHIP_FIELDS,
        Vehicle => VEHICLE_FIELDS,
        Director | Producer | Manufacturer | Climate | Terrain | StarshipClass | VehicleClass => &[],
    }
}

/// Look up one field of a kind by name.
pub fn field(kind: EntityKind, name: &str) -> Option<&'static FieldSpec> {
    fields_of(kind).iter().find(|f| f.name == name)
}
