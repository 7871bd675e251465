use async_trait::async_trait;
use dashmap::DashMap;
use ng_devhub_models::services::PopulationResolver;
use uuid::Uuid;

pub const DEFAULT_POPULATION: &str = "general";

/// Place-to-population lookup held in memory.
#[derive(Debug)]
pub struct InMemoryPopulationResolver {
    populations: DashMap<Uuid, String>,
    default_population: String,
}

impl Default for InMemoryPopulationResolver {
    fn default() -> Self {
        Self {
            populations: DashMap::new(),
            default_population: DEFAULT_POPULATION.to_string(),
        }
    }
}

impl InMemoryPopulationResolver {
    pub fn assign(&self, place_id: Uuid, population: impl Into<String>) {
        self.populations.insert(place_id, population.into());
    }
}

#[async_trait]
impl PopulationResolver for InMemoryPopulationResolver {
    async fn get_population_by_place_id(&self, place_id: Option<Uuid>) -> String {
        place_id
            .and_then(|id| self.populations.get(&id).map(|p| p.value().clone()))
            .unwrap_or_else(|| self.default_population.clone())
    }
}
