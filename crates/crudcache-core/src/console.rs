//! Application root: one shared cache and a façade per entity type.

use anyhow::Result;
use tracing::info;

use crate::cache::QueryCache;
use crate::facade::{BackendFamily, EntityFacade};
use crate::models::{City, Company, Department, Shift, Skill, State};

type Facade<F, E> = EntityFacade<E, <F as BackendFamily>::Backend<E>>;

/// Every entity façade of the admin console, built over one `QueryCache`.
pub struct Console<F: BackendFamily> {
    cache: QueryCache,
    pub states: Facade<F, State>,
    pub cities: Facade<F, City>,
    pub companies: Facade<F, Company>,
    pub departments: Facade<F, Department>,
    pub skills: Facade<F, Skill>,
    pub shifts: Facade<F, Shift>,
}

impl<F: BackendFamily> Console<F> {
    pub fn new(family: &F) -> Self {
        let cache = QueryCache::new();
        Self {
            states: EntityFacade::new(cache.clone(), family.backend()),
            cities: EntityFacade::new(cache.clone(), family.backend()),
            companies: EntityFacade::new(cache.clone(), family.backend()),
            departments: EntityFacade::new(cache.clone(), family.backend()),
            skills: EntityFacade::new(cache.clone(), family.backend()),
            shifts: EntityFacade::new(cache.clone(), family.backend()),
            cache,
        }
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    /// Load every list concurrently. Fails if any list fails; lists that did
    /// load are kept in the cache.
    pub async fn refresh_all(&self) -> Result<()> {
        let (states, cities, companies, departments, skills, shifts) = futures::join!(
            self.states.refresh(),
            self.cities.refresh(),
            self.companies.refresh(),
            self.departments.refresh(),
            self.skills.refresh(),
            self.shifts.refresh(),
        );
        info!(
            states = states?.len(),
            cities = cities?.len(),
            companies = companies?.len(),
            departments = departments?.len(),
            skills = skills?.len(),
            shifts = shifts?.len(),
            "all lists loaded"
        );
        Ok(())
    }

    /// Mutations applied optimistically and not yet settled, across all lists.
    pub fn in_flight(&self) -> usize {
        self.states.in_flight()
            + self.cities.in_flight()
            + self.companies.in_flight()
            + self.departments.in_flight()
            + self.skills.in_flight()
            + self.shifts.in_flight()
    }
}
