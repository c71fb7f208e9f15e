//! Contract bindings for the betting factory, per-market contract and the
//! price-feed aggregator. Human-readable ABIs: the engine only drives the
//! external entry points, the contract implementations live elsewhere.

use ethers::prelude::*;

// Market factory: mints one betting contract per market.
abigen!(
    MarketFactory,
    r#"[
        function createMarket(uint256 settlementTime, uint256 targetPrice, address priceFeedAddress) external returns (address)
        event NewMarketCreated(address newMarketAddress)
    ]"#
);

// Per-market betting contract.
abigen!(
    BettingMarket,
    r#"[
        function placeBet(bool isAbove) external payable
        function finalize() external
        function getLatestPrice() external view returns (int256)
        function targetPrice() external view returns (uint256)
        function settlementTime() external view returns (uint256)
        function isFinalized() external view returns (bool)
    ]"#
);

// Chainlink-style aggregator, read-only. Prices are 8-decimal fixed point.
abigen!(
    PriceFeedAggregator,
    r#"[
        function latestRoundData() external view returns (uint80 roundId, int256 answer, uint256 startedAt, uint256 updatedAt, uint80 answeredInRound)
    ]"#
);
