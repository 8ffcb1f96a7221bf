pub mod challenge;
pub mod discovery;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod normalize;
pub mod orchestrator;
pub mod rate_limit;
pub mod region;
pub mod run_log;
pub mod targets;

pub use challenge::{classify, ChallengeResolver, LivePage, PageSnapshot, PageState, Settled};
pub use discovery::{Discovered, DiscoveryError, SelectorDiscovery};
pub use error::{ExtractionError, FetchError, PersistenceError, PriceParseError, VisionError};
pub use extract::{
    ContentExtractor, ExtractionInput, ExtractionResult, Extractor, OpenAiVision,
    PatternExtractor, SelectorExtractor, VisionExtractor, VisionModel, VisionRequest,
    VisionResponse,
};
pub use fetch::{
    find_chromium, BrowserFetcher, BrowserOptions, CheckedFailure, CheckedSuccess, FetchAttempt,
    FetchLadder, FetchRequest, FetchedPage, LadderFailure, LadderPolicy, LadderSettings,
    LadderSuccess, PageCheck, PageFetcher, PlainFetcher, TieredFetcher,
};
pub use normalize::{normalize_period, parse_price, ParsedPrice, PriceNormalizer};
pub use orchestrator::{ObservationSink, Orchestrator, RunReport};
pub use rate_limit::{Pacing, RecordingSleeper, Sleeper, TokioSleeper};
pub use region::{RegionDirectory, RegionResolver, Resolution, ResolutionSource};
pub use run_log::{PairOutcome, RunLog, RunSummary};
pub use targets::{plan_targets, ScrapeTarget};
